// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the Messaging Core
//!
//! This module provides the error taxonomy shared by the connection manager,
//! topology declarator, producer and consumer. Transport failures are absorbed
//! by the connection state machine, handler failures by the consumer, and only
//! usage errors reach the caller synchronously.

use thiserror::Error;

/// Error returned by message handlers. The consumer wraps it into
/// [`AmqpError::HandlerFailure`] before applying the redelivery policy.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Represents errors that can occur during messaging operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// The connection is not usable right now; the operation may be retried
    #[error("connection lost")]
    ConnectionLost,

    /// Operation attempted after an explicit shutdown
    #[error("connection manager is closed")]
    Closed,

    /// Channel name is not part of the active topology
    #[error("unknown channel `{0}`")]
    UnknownChannel(String),

    /// An entity was redeclared with incompatible parameters
    #[error("declaration conflict on `{0}`")]
    DeclarationConflict(String),

    /// A handler failed while processing a message
    #[error("handler failure: {0}")]
    HandlerFailure(String),

    /// The broker declined the message
    #[error("publish rejected: {0}")]
    PublishRejected(String),

    /// The configuration handed to the core is not usable
    #[error("invalid configs: {0}")]
    InvalidConfigs(String),

    /// Error establishing a connection to the broker
    #[error("failure to connect")]
    ConnectionError,

    /// Error creating a channel from an established connection
    #[error("failure to create a channel")]
    ChannelError,

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding an exchange to a queue
    #[error("failure to binding exchange `{0}` to queue `{1}`")]
    BindingExchangeToQueueError(String, String),

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// Error declaring a consumer
    #[error("failure to declare consumer `{0}`")]
    ConsumerDeclarationError(String),

    /// Error publishing a message
    #[error("failure to publish")]
    PublishingError,

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error negative-acknowledging a message
    #[error("failure to nack message")]
    NackMessageError,
}

impl AmqpError {
    /// Whether the caller may retry the failed operation as is.
    pub fn is_retryable(&self) -> bool {
        matches!(self, AmqpError::ConnectionLost)
    }

    /// Whether the error names a topology entity that could not be declared.
    pub fn is_declaration_failure(&self) -> bool {
        matches!(
            self,
            AmqpError::DeclarationConflict(_)
                | AmqpError::DeclareExchangeError(_)
                | AmqpError::DeclareQueueError(_)
                | AmqpError::BindingExchangeToQueueError(_, _)
        )
    }
}
