//! HTTP client for the seat authority.
//!
//! The relay owns all seat-allocation logic; the client only calls the
//! bearer-authenticated endpoints and surfaces non-2xx responses with the
//! HTTP status attached.

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::model::{Screening, SeatPosition};
use crate::session::SessionError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinScreeningRequest {
    pub screening_id: String,
    pub visitor_name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JoinScreeningResponse {
    pub token: String,
    pub visitor_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectSeatRequest {
    pub row_number: u32,
    pub seat_number: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SelectSeatResponse {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub seat: Option<SeatPosition>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReleaseSeatResponse {
    #[serde(default)]
    pub success: bool,
}

/// The HTTP surface, as a trait so tests can substitute a recording
/// implementation.
#[async_trait]
pub trait SeatBackend: Send + Sync {
    async fn join_screening(
        &self,
        base_url: &Url,
        request: &JoinScreeningRequest,
    ) -> Result<JoinScreeningResponse, SessionError>;

    async fn select_seat(
        &self,
        base_url: &Url,
        token: &str,
        screening_id: &str,
        request: &SelectSeatRequest,
    ) -> Result<SelectSeatResponse, SessionError>;

    async fn release_seat(
        &self,
        base_url: &Url,
        token: &str,
        screening_id: &str,
    ) -> Result<ReleaseSeatResponse, SessionError>;

    async fn heartbeat(
        &self,
        base_url: &Url,
        token: &str,
        screening_id: &str,
    ) -> Result<(), SessionError>;

    async fn get_screening(
        &self,
        base_url: &Url,
        token: &str,
        screening_id: &str,
    ) -> Result<Screening, SessionError>;
}

pub struct ReqwestSeatBackend {
    client: reqwest::Client,
}

impl ReqwestSeatBackend {
    pub fn new() -> Result<Self, SessionError> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .map_err(|err| SessionError::Http(err.to_string()))?;
        Ok(Self { client })
    }
}

fn endpoint(base_url: &Url, path: &str) -> Result<Url, SessionError> {
    base_url
        .join(path)
        .map_err(|err| SessionError::InvalidConfig(format!("invalid endpoint {path}: {err}")))
}

fn check_status(status: StatusCode) -> Result<(), SessionError> {
    if status.is_success() {
        Ok(())
    } else {
        Err(SessionError::SeatAuthority {
            status: status.as_u16(),
        })
    }
}

#[async_trait]
impl SeatBackend for ReqwestSeatBackend {
    async fn join_screening(
        &self,
        base_url: &Url,
        request: &JoinScreeningRequest,
    ) -> Result<JoinScreeningResponse, SessionError> {
        let url = endpoint(base_url, "api/auth/visitor")?;
        let response = self
            .client
            .post(url)
            .json(request)
            .send()
            .await
            .map_err(|err| SessionError::Http(err.to_string()))?;
        check_status(response.status())?;
        response
            .json()
            .await
            .map_err(|err| SessionError::Http(err.to_string()))
    }

    async fn select_seat(
        &self,
        base_url: &Url,
        token: &str,
        screening_id: &str,
        request: &SelectSeatRequest,
    ) -> Result<SelectSeatResponse, SessionError> {
        let url = endpoint(base_url, &format!("api/screenings/{screening_id}/seats"))?;
        let response = self
            .client
            .post(url)
            .bearer_auth(token)
            .json(request)
            .send()
            .await
            .map_err(|err| SessionError::Http(err.to_string()))?;
        check_status(response.status())?;
        response
            .json()
            .await
            .map_err(|err| SessionError::Http(err.to_string()))
    }

    async fn release_seat(
        &self,
        base_url: &Url,
        token: &str,
        screening_id: &str,
    ) -> Result<ReleaseSeatResponse, SessionError> {
        let url = endpoint(
            base_url,
            &format!("api/screenings/{screening_id}/seats/release"),
        )?;
        let response = self
            .client
            .post(url)
            .bearer_auth(token)
            .send()
            .await
            .map_err(|err| SessionError::Http(err.to_string()))?;
        check_status(response.status())?;
        response
            .json()
            .await
            .map_err(|err| SessionError::Http(err.to_string()))
    }

    async fn heartbeat(
        &self,
        base_url: &Url,
        token: &str,
        screening_id: &str,
    ) -> Result<(), SessionError> {
        let url = endpoint(base_url, &format!("api/screenings/{screening_id}/heartbeat"))?;
        let response = self
            .client
            .post(url)
            .bearer_auth(token)
            .send()
            .await
            .map_err(|err| SessionError::Http(err.to_string()))?;
        check_status(response.status())
    }

    async fn get_screening(
        &self,
        base_url: &Url,
        token: &str,
        screening_id: &str,
    ) -> Result<Screening, SessionError> {
        let url = endpoint(base_url, &format!("api/screenings/{screening_id}"))?;
        let response = self
            .client
            .get(url)
            .bearer_auth(token)
            .send()
            .await
            .map_err(|err| SessionError::Http(err.to_string()))?;
        check_status(response.status())?;
        response
            .json()
            .await
            .map_err(|err| SessionError::Http(err.to_string()))
    }
}

/// Bearer-authenticated handle on the seat authority for one session.
#[derive(Clone)]
pub struct SeatAuthorityClient {
    base_url: Url,
    screening_id: String,
    token: String,
    backend: Arc<dyn SeatBackend>,
}

impl SeatAuthorityClient {
    pub fn new(base_url: Url, screening_id: String, token: String) -> Result<Self, SessionError> {
        let backend = Arc::new(ReqwestSeatBackend::new()?);
        Ok(Self {
            base_url,
            screening_id,
            token,
            backend,
        })
    }

    pub(crate) fn with_backend(
        base_url: Url,
        screening_id: String,
        token: String,
        backend: Arc<dyn SeatBackend>,
    ) -> Self {
        Self {
            base_url,
            screening_id,
            token,
            backend,
        }
    }

    pub async fn select(&self, row: u32, seat: u32) -> Result<SelectSeatResponse, SessionError> {
        self.backend
            .select_seat(
                &self.base_url,
                &self.token,
                &self.screening_id,
                &SelectSeatRequest {
                    row_number: row,
                    seat_number: seat,
                },
            )
            .await
    }

    pub async fn release(&self) -> Result<ReleaseSeatResponse, SessionError> {
        self.backend
            .release_seat(&self.base_url, &self.token, &self.screening_id)
            .await
    }

    pub async fn heartbeat(&self) -> Result<(), SessionError> {
        self.backend
            .heartbeat(&self.base_url, &self.token, &self.screening_id)
            .await
    }

    pub async fn screening(&self) -> Result<Screening, SessionError> {
        self.backend
            .get_screening(&self.base_url, &self.token, &self.screening_id)
            .await
    }
}

/// Ask the relay for a bearer credential for this screening. Used by the
/// binary when the caller did not supply a token.
pub async fn join_screening(
    base_url: &Url,
    screening_id: &str,
    visitor_name: &str,
) -> Result<JoinScreeningResponse, SessionError> {
    let backend = ReqwestSeatBackend::new()?;
    backend
        .join_screening(
            base_url,
            &JoinScreeningRequest {
                screening_id: screening_id.to_string(),
                visitor_name: visitor_name.to_string(),
            },
        )
        .await
}
