// src/tests/mod.rs

mod rate_limiter_tests;
