pub mod analyzers;
pub mod catalog;
pub mod config;
pub mod output;
pub mod parser;
pub mod positions;
pub mod query;
pub mod state;
pub mod stats;
pub mod store;

pub mod gtfs_rt {
    include!(concat!(env!("OUT_DIR"), "/transit_realtime.rs"));
}
