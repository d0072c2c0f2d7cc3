pub mod run;
pub mod show;
pub mod validate;

pub use run::RunArgs;
pub use show::ShowArgs;
pub use validate::ValidateArgs;
