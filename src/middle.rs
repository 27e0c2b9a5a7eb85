//! The middle-end of the compiler: temporaries and labels, the tree IR,
//! activation records with their pointer maps, translation from the typed
//! AST, and canonicalisation into trace-scheduled statement lists.

pub mod canon;
pub mod fragment;
pub mod frame;
pub mod temp;
pub mod translate;
pub mod tree;

pub use canon::canonicalise;
pub use fragment::*;
pub use frame::*;
pub use temp::*;
pub use translate::translate_program;
