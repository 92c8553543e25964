pub mod fairness;
pub mod hash;
