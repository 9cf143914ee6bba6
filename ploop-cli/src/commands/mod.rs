pub mod balloon;
pub mod check;
