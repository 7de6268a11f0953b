//! Integration tests against a live Redis live under `tests/`.
//!
//! They are `#[ignore]`d by default; run them with a Redis reachable at
//! `REDIS_URL` (default `redis://127.0.0.1/`):
//!
//! ```sh
//! REDIS_URL=redis://127.0.0.1/ cargo test -p tarefa-e2e -- --ignored
//! ```
