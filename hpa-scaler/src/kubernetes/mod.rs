pub mod cluster;
pub mod controller;
pub mod models;
pub mod replicasets;
pub mod scaler;
