//! Cross-crate tests for fxrack: the runtime lifecycle driven through the
//! chain, the renderer and both rate converters.

#[cfg(test)]
mod runtime_integration;
