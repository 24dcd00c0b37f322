/// Identifier newtypes
pub mod identifiers;

/// Agent modes and instances
pub mod agent;

/// Knowledge graph nodes and edges
pub mod knowledge;

/// Sessions and messages
pub mod session;

/// Rules, conditions and evaluation
pub mod rule;

/// Learning events
pub mod learning;

/// Prompt templates and executions
pub mod prompt;

/// Repository interfaces
pub mod repository;
