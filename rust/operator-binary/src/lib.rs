pub mod controller;
pub mod crd;
pub mod pki;
pub mod store;
pub mod utils;

pub const OPERATOR_NAME: &str = "pki.dbcluster.tech";
