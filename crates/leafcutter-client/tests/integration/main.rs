mod common;
mod listing_tests;
mod api_tests;
