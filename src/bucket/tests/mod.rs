// src/bucket/tests/mod.rs
