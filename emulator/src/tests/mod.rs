//! Test modules for the emulator crate


mod api_tests;
mod dispatcher_tests;
mod oidc_tests;
