//! edgemon: a CDN cache health and statistics monitor.
//!
//! edgemon polls every cache in a CDN over HTTP, derives per-cache and
//! per-delivery-service availability and traffic statistics, exchanges
//! availability state with peer monitors, and publishes the combined view
//! for content routers to route traffic by.

extern crate bytes;
extern crate futures;
extern crate hyper;
#[macro_use]
extern crate log;
extern crate notify;
extern crate rand;
extern crate regex;
extern crate serde;
#[macro_use]
extern crate serde_derive;
extern crate serde_json;
extern crate serde_yaml;
extern crate tacho;
extern crate tokio_core;
extern crate tokio_timer;
extern crate url;

pub mod cache;
pub mod cell;
pub mod config;
pub mod ds;
pub mod fetcher;
pub mod handler;
pub mod health;
pub mod instrument;
pub mod logger;
pub mod manager;
pub mod names;
pub mod ops;
pub mod peer;
pub mod poller;
pub mod topology;
