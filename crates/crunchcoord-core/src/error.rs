// Copyright (c) 2026 Crunchcoord Contributors
// SPDX-License-Identifier: Apache-2.0

use crunchcoord_protocol::ErrorCode;
use thiserror::Error;

pub type CoordResult<T> = Result<T, CoordError>;

#[derive(Debug, Error)]
pub enum CoordError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid status transition: {0}")]
    InvalidTransition(String),

    #[error("emission payload violates frac64 conservation: {0}")]
    EmissionImbalance(#[from] crunchcoord_protocol::EmissionError),

    #[error("another job already holds admission: {0}")]
    AdmissionDenied(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("inference input rejected: {0}")]
    InputRejected(String),

    #[error("canonical encoding failed")]
    Encoding,

    #[error("internal error: {0}")]
    Internal(String),
}

impl CoordError {
    pub fn code(&self) -> ErrorCode {
        match self {
            CoordError::InvalidArgument(_) | CoordError::InputRejected(_) => {
                ErrorCode::EInvalidArgument
            }
            CoordError::NotFound(_) => ErrorCode::ENotFound,
            CoordError::InvalidTransition(_) => ErrorCode::EInvalidState,
            CoordError::EmissionImbalance(_) => ErrorCode::EEmissionImbalance,
            CoordError::AdmissionDenied(_) => ErrorCode::EAdmissionDenied,
            CoordError::Config(_) => ErrorCode::EConfig,
            CoordError::Encoding | CoordError::Internal(_) => ErrorCode::EInternal,
        }
    }
}
