//! Scenario tests spanning the vesper crates live under `tests/`.
