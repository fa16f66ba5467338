pub mod run;
pub mod validate;

pub use run::RunArgs;
pub use validate::ValidateArgs;
