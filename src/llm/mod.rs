//! Structured LLM worker wrapper: provider transport, per-phase output
//! schemas, retry/backoff, and normalization.

pub mod client;
pub mod schema;

pub use client::{
    HttpLlmClient, LlmError, LlmOptions, LlmProvider, LlmRaw, LlmRequest, StructuredLlm,
    StructuredResult,
};
pub use schema::{
    DiscoveryOutput, FactorCandidate, FactorRating, PhaseOutput, RatingOutput, ResearchOutput,
    SynthesisOutput, ValidationOutput,
};
