pub mod cache;
pub mod clock;
pub mod config;
pub mod cursor;
pub mod decode;
pub mod entitlement;
pub mod error;
pub mod generator;
pub mod model;
pub mod normalize;
pub mod orchestrator;
pub mod provider;
pub mod storage;
pub mod tips;
