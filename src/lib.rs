pub mod config;
pub mod controller;
pub mod crd;
pub mod deploy;
pub mod deployables;
pub mod error;
pub mod helpers;
pub mod images;
pub mod k8s;
pub mod keycloak;
