//! Azure Blob Storage over its REST API.

mod auth;
mod blob;
mod client;

pub use client::AzureBlobClient;
