//! Stash transaction worker daemon: wires the drain engine and the CDN
//! invalidation walker to AMQP, S3, PostgreSQL and KeyCDN.

pub mod amqp;
pub mod config;
pub mod health;
pub mod keycdn;
pub mod s3;
pub mod telemetry;
pub mod worker;
