//! Tests for the register manager using only its public API

mod stress_tests;
