//! Data model and discovery wire protocol for the meshfed federation
//! controller.
//!
//! This crate carries the configuration documents fed to the controller
//! (mesh peers plus the export/import selector sets), the federated service
//! shape exchanged between peers, input validation for all of the above,
//! and the gRPC discovery protocol used on the federation stream.

pub mod grpc;
pub mod model;
pub mod validation;
