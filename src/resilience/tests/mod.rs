// src/resilience/tests/mod.rs
//! Tests for lock retry pacing and the storage failure policy
