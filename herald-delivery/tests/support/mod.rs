//! Test doubles shared by the integration tests
#![allow(dead_code)] // Test utility module - not all methods used in every test

pub mod mock_channel;
