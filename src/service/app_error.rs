// Copyright 2025 The framewire authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// general errors
    #[error("illegal state: {0}")]
    IllegalStateError(String),

    #[error("invalid value: {0}")]
    InvalidValue(String),

    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// transport errors
    #[error("I/O error: {0}")]
    DetailedIoError(String),

    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("accept error: {0}")]
    Accept(String),

    /// framing errors
    #[error("corrupt frame: {0}")]
    CorruptFrame(String),

    #[error("frame too large: {0}")]
    FrameTooLarge(String),

    /// channel errors
    #[error("channel send error: {0}")]
    ChannelSendError(String),

    #[error("channel recv error: {0}")]
    ChannelRecvError(String),

    #[error("config file error: {0}")]
    ConfigFileError(#[from] config::ConfigError),
}

impl AppError {
    /// Transport and framing failures are fatal for the affected connection
    /// but must never tear down the engine.
    pub fn is_connection_fatal(&self) -> bool {
        matches!(
            self,
            AppError::DetailedIoError(_) | AppError::IoError(_) | AppError::CorruptFrame(_)
        )
    }
}
