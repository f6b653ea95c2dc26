pub mod docker;
pub mod logstore;
pub mod proxy;
pub mod web;
