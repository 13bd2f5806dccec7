//! fxrack core: the per-block effect runtime
//!
//! Everything that runs on the audio thread lives here. Platform glue and the
//! sinc resampler backend live in the `infra` crate.

pub mod domain;
