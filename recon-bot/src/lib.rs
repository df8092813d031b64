// Configuration (YAML file + environment)
pub mod config;

// SQLite run store
pub mod database;

// trickest-cli workflow client
pub mod trickest;

// Background status poller
pub mod poller;

// Scope collection form
pub mod conversation;

// Chat-facing capabilities
pub mod service;

// Command routing
pub mod dispatcher;

// Telegram Bot API transport
pub mod telegram;
