// Copyright 2025 LiveKit, Inc.
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

use std::{
    env,
    error::Error,
    future::{ready, Future},
};

#[derive(Debug, thiserror::Error)]
pub enum TokenSourceError {
    #[error("environment variable {0} is not set")]
    MissingEnvironment(&'static str),
    #[error("Other error: {0}")]
    Other(#[from] Box<dyn Error + Send + Sync>),
}

pub type TokenSourceResult<T> = Result<T, TokenSourceError>;

/// Connection details handed to the transport.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TokenSourceResponse {
    pub server_url: String,
    pub participant_token: String,
}

/// Supplies the server URL and token for a connection attempt.
///
/// A session fetches exactly once per call to `start`.
pub trait TokenSource: Send + Sync {
    fn fetch(&self) -> impl Future<Output = TokenSourceResult<TokenSourceResponse>> + Send;
}

/// A helper trait to more easily implement a [`TokenSource`] which is not async.
pub trait TokenSourceSynchronous: Send + Sync {
    fn fetch_synchronous(&self) -> TokenSourceResult<TokenSourceResponse>;
}

impl<T: TokenSourceSynchronous> TokenSource for T {
    fn fetch(&self) -> impl Future<Output = TokenSourceResult<TokenSourceResponse>> + Send {
        ready(self.fetch_synchronous())
    }
}

pub trait TokenLiteralGenerator: Send + Sync {
    fn apply(&self) -> TokenSourceResponse;
}

impl TokenLiteralGenerator for TokenSourceResponse {
    fn apply(&self) -> TokenSourceResponse {
        self.clone()
    }
}

impl<F: Fn() -> TokenSourceResponse + Send + Sync> TokenLiteralGenerator for F {
    fn apply(&self) -> TokenSourceResponse {
        self()
    }
}

/// Token source returning a fixed response, or the output of a generator
/// closure on every fetch.
pub struct TokenSourceLiteral<Generator: TokenLiteralGenerator> {
    generator: Generator,
}

impl<G: TokenLiteralGenerator> TokenSourceLiteral<G> {
    pub fn new(generator: G) -> Self {
        Self { generator }
    }
}

impl TokenSourceLiteral<TokenSourceResponse> {
    pub fn from_parts(server_url: impl Into<String>, participant_token: impl Into<String>) -> Self {
        Self::new(TokenSourceResponse {
            server_url: server_url.into(),
            participant_token: participant_token.into(),
        })
    }
}

impl<G: TokenLiteralGenerator> TokenSourceSynchronous for TokenSourceLiteral<G> {
    fn fetch_synchronous(&self) -> TokenSourceResult<TokenSourceResponse> {
        Ok(self.generator.apply())
    }
}

/// Reads `LIVEKIT_URL` and `LIVEKIT_TOKEN` from the environment on each fetch.
#[derive(Clone, Debug)]
pub struct TokenSourceEnvironment {
    url_var: &'static str,
    token_var: &'static str,
}

impl Default for TokenSourceEnvironment {
    fn default() -> Self {
        Self { url_var: "LIVEKIT_URL", token_var: "LIVEKIT_TOKEN" }
    }
}

impl TokenSourceEnvironment {
    pub fn with_variables(url_var: &'static str, token_var: &'static str) -> Self {
        Self { url_var, token_var }
    }
}

impl TokenSourceSynchronous for TokenSourceEnvironment {
    fn fetch_synchronous(&self) -> TokenSourceResult<TokenSourceResponse> {
        let server_url =
            env::var(self.url_var).map_err(|_| TokenSourceError::MissingEnvironment(self.url_var))?;
        let participant_token = env::var(self.token_var)
            .map_err(|_| TokenSourceError::MissingEnvironment(self.token_var))?;
        Ok(TokenSourceResponse { server_url, participant_token })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_literal() {
        let source = TokenSourceLiteral::from_parts("wss://example", "token");
        let response = source.fetch().await.unwrap();
        assert_eq!(response.server_url, "wss://example");
        assert_eq!(response.participant_token, "token");
    }

    #[tokio::test]
    async fn test_generator_runs_per_fetch() {
        let counter = AtomicU32::new(0);
        let source = TokenSourceLiteral::new(move || {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            TokenSourceResponse {
                server_url: "wss://example".to_owned(),
                participant_token: format!("token-{n}"),
            }
        });
        assert_eq!(source.fetch().await.unwrap().participant_token, "token-0");
        assert_eq!(source.fetch().await.unwrap().participant_token, "token-1");
    }

    #[tokio::test]
    async fn test_environment_missing() {
        let source =
            TokenSourceEnvironment::with_variables("LK_TEST_UNSET_URL", "LK_TEST_UNSET_TOKEN");
        assert!(matches!(
            source.fetch().await,
            Err(TokenSourceError::MissingEnvironment("LK_TEST_UNSET_URL"))
        ));
    }
}
