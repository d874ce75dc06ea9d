//! Challenge/response negotiation for one logical request
//!
//! A 407 on the first response triggers exactly one credential-bearing
//! resubmission under the same request id. A second 407, a 401, or a missing
//! credential source ends the request with an authentication error.

use tracing::{debug, info, warn};

use super::credentials::{Challenge, Credentials};
use crate::protocol::{Completion, QueryResult, RequestEnvelope, RequestId, StatusCode};
use crate::types::{Result, SessionError};

/// Where the negotiation stands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    AwaitingFirstResponse,
    AwaitingChallengeResponse,
    Done,
    Failed,
}

/// What the session should do next
#[derive(Debug)]
pub enum AuthStep {
    /// Hand the result to the caller
    Complete(QueryResult),
    /// Send this envelope and wait again on the same request id
    Resubmit(RequestEnvelope),
}

pub struct AuthNegotiator<'a> {
    request_id: RequestId,
    credentials: Option<&'a Credentials>,
    state: AuthState,
}

impl<'a> AuthNegotiator<'a> {
    pub fn new(request_id: RequestId, credentials: Option<&'a Credentials>) -> Self {
        Self {
            request_id,
            credentials,
            state: AuthState::AwaitingFirstResponse,
        }
    }

    pub fn state(&self) -> AuthState {
        self.state
    }

    /// Advance on a terminal response for this request.
    pub async fn on_response(&mut self, completion: Completion) -> Result<AuthStep> {
        let code = completion.code();

        if code.is_success() {
            if self.state == AuthState::AwaitingChallengeResponse {
                info!(request_id = %self.request_id, "Authenticated with server");
            }
            self.state = AuthState::Done;
            return Ok(AuthStep::Complete(completion.into_result()));
        }

        match code {
            StatusCode::AuthenticationRequired => self.on_challenge(&completion).await,
            StatusCode::Unauthorized => {
                self.state = AuthState::Failed;
                let message = if completion.status.message.is_empty() {
                    "unauthorized".to_string()
                } else {
                    completion.status.message
                };
                warn!(request_id = %self.request_id, %message, "Server rejected request as unauthorized");
                Err(SessionError::Authentication(message))
            }
            other => {
                self.state = AuthState::Failed;
                Err(SessionError::Server {
                    code: other.as_u16(),
                    message: completion.status.message,
                })
            }
        }
    }

    async fn on_challenge(&mut self, completion: &Completion) -> Result<AuthStep> {
        if self.state != AuthState::AwaitingFirstResponse {
            self.state = AuthState::Failed;
            warn!(request_id = %self.request_id, "Credentials rejected by server");
            return Err(SessionError::Authentication(
                "credentials rejected by server".to_string(),
            ));
        }

        let Some(credentials) = self.credentials else {
            self.state = AuthState::Failed;
            warn!(request_id = %self.request_id, "Server requires authentication but no credentials are configured");
            return Err(SessionError::Authentication(
                "server requires authentication but no credentials are configured".to_string(),
            ));
        };

        let challenge = Challenge::from(&completion.status);
        let answer = match credentials.answer(&challenge).await {
            Ok(answer) => answer,
            Err(e) => {
                self.state = AuthState::Failed;
                warn!(request_id = %self.request_id, error = %e, "Credential provider failed");
                return Err(SessionError::Authentication(format!(
                    "credential provider failed: {e}"
                )));
            }
        };

        debug!(request_id = %self.request_id, "Answering authentication challenge");
        self.state = AuthState::AwaitingChallengeResponse;
        Ok(AuthStep::Resubmit(RequestEnvelope::authentication(
            self.request_id.clone(),
            &answer,
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ResponseStatus;
    use serde_json::{json, Map};

    fn completion(code: u16, message: &str) -> Completion {
        Completion {
            status: ResponseStatus {
                message: message.to_string(),
                code,
                attributes: Map::new(),
            },
            data: vec![json!("v")],
            meta: Map::new(),
        }
    }

    #[tokio::test]
    async fn test_success_without_challenge() {
        let mut negotiator = AuthNegotiator::new(RequestId::from("a"), None);
        let step = negotiator.on_response(completion(200, "")).await.unwrap();
        assert!(matches!(step, AuthStep::Complete(ref r) if r.data == vec![json!("v")]));
        assert_eq!(negotiator.state(), AuthState::Done);
    }

    #[tokio::test]
    async fn test_single_resubmit_then_success() {
        let creds = Credentials::plain("user", "pass");
        let mut negotiator = AuthNegotiator::new(RequestId::from("a"), Some(&creds));

        let step = negotiator.on_response(completion(407, "")).await.unwrap();
        let AuthStep::Resubmit(envelope) = step else {
            panic!("expected resubmit");
        };
        assert_eq!(envelope.request_id, RequestId::from("a"));
        assert_eq!(envelope.op, "authentication");
        assert_eq!(negotiator.state(), AuthState::AwaitingChallengeResponse);

        let step = negotiator.on_response(completion(200, "")).await.unwrap();
        assert!(matches!(step, AuthStep::Complete(_)));
    }

    #[tokio::test]
    async fn test_second_challenge_fails() {
        let creds = Credentials::plain("user", "wrong");
        let mut negotiator = AuthNegotiator::new(RequestId::from("a"), Some(&creds));

        negotiator.on_response(completion(407, "")).await.unwrap();
        let err = negotiator.on_response(completion(407, "")).await.unwrap_err();
        assert!(matches!(err, SessionError::Authentication(_)));
        assert_eq!(negotiator.state(), AuthState::Failed);
    }

    #[tokio::test]
    async fn test_challenge_without_credentials_fails() {
        let mut negotiator = AuthNegotiator::new(RequestId::from("a"), None);
        let err = negotiator.on_response(completion(407, "")).await.unwrap_err();
        assert!(matches!(err, SessionError::Authentication(_)));
    }

    #[tokio::test]
    async fn test_unauthorized_carries_message() {
        let mut negotiator = AuthNegotiator::new(RequestId::from("a"), None);
        let err = negotiator
            .on_response(completion(401, "Username and/or password are incorrect"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("incorrect"));
    }

    #[tokio::test]
    async fn test_other_codes_are_server_errors() {
        let mut negotiator = AuthNegotiator::new(RequestId::from("a"), None);
        let err = negotiator
            .on_response(completion(597, "No such property: foo"))
            .await
            .unwrap_err();
        match err {
            SessionError::Server { code, message } => {
                assert_eq!(code, 597);
                assert_eq!(message, "No such property: foo");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
