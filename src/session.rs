use tracing::{debug, info, warn};

use crate::logger::MessageLogger;
use crate::protocol::{
    gateways_url, login_body, login_url, plant_id_from_body, plant_id_from_url, GatewayEntry,
    LOGIN_TIMEOUT,
};
use crate::transport::Transport;
use crate::{Error, Result};

/// Login state and the plant id resolved from it.
#[derive(Debug)]
pub(crate) struct Session {
    base_url: String,
    username: String,
    password: String,
    gateway: Option<String>,
    plant: Option<String>,
}

impl Session {
    pub fn new(base_url: &str, username: &str, password: &str, gateway: Option<&str>) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            username: username.to_string(),
            password: password.to_string(),
            gateway: gateway.map(str::to_string),
            plant: None,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn plant(&self) -> Option<&str> {
        self.plant.as_deref()
    }

    pub fn is_logged_in(&self) -> bool {
        self.plant.is_some()
    }

    /// Returns the cached plant id, logging in first when there is none.
    pub async fn ensure_logged_in<T: Transport>(
        &mut self,
        transport: &T,
        logger: Option<&mut MessageLogger>,
    ) -> Result<String> {
        if let Some(plant) = &self.plant {
            return Ok(plant.clone());
        }

        let url = login_url(&self.base_url);
        debug!(url = %url, "logging in");
        let body = login_body(&self.username, &self.password);
        let resp = transport.post(&url, LOGIN_TIMEOUT, &body).await?;

        let plant = plant_id_from_url(&resp.url).or_else(|| plant_id_from_body(&resp.body));
        if let Some(logger) = logger {
            logger.log_login(&resp.url, resp.status, plant.as_deref());
        }
        if resp.status != 200 {
            return Err(Error::Auth(format!("login returned status {}", resp.status)));
        }
        let plant = plant.ok_or_else(|| {
            Error::Auth(format!("no plant id in login response from {}", resp.url))
        })?;

        if let Some(expected) = &self.gateway {
            self.check_gateway(transport, expected, &plant).await?;
        }

        info!(plant = %plant, "logged in");
        self.plant = Some(plant.clone());
        Ok(plant)
    }

    async fn check_gateway<T: Transport>(
        &self,
        transport: &T,
        expected: &str,
        plant: &str,
    ) -> Result<()> {
        let resp = transport.get(&gateways_url(&self.base_url), LOGIN_TIMEOUT).await?;
        let gateways: Vec<GatewayEntry> = serde_json::from_value(resp.json()?)?;
        let listed = gateways.iter().any(|g| g.gw.as_deref() == Some(plant));
        if plant != expected || !listed {
            warn!(expected = %expected, found = %plant, listed, "gateway mismatch");
            return Err(Error::GatewayMismatch {
                expected: expected.to_string(),
                found: plant.to_string(),
            });
        }
        Ok(())
    }

    /// Drops the plant id and the transport's session cookie.
    pub fn logout<T: Transport>(&mut self, transport: &T) {
        if self.plant.take().is_some() {
            debug!("logged out");
        }
        transport.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::HttpResponse;
    use serde_json::Value;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Answers every POST with `login` and every GET with `gateways`.
    struct Canned {
        login: HttpResponse,
        gateways: &'static str,
        calls: Mutex<Vec<String>>,
        resets: Mutex<u32>,
    }

    impl Canned {
        fn new(status: u16, final_url: &str, body: &str) -> Self {
            Self {
                login: HttpResponse {
                    status,
                    url: final_url.to_string(),
                    body: body.to_string(),
                },
                gateways: r#"[{"gw": "PL123"}, {"gw": "OTHER9"}]"#,
                calls: Mutex::new(Vec::new()),
                resets: Mutex::new(0),
            }
        }
    }

    impl Transport for Canned {
        async fn get(&self, url: &str, _timeout: Duration) -> Result<HttpResponse> {
            self.calls.lock().unwrap().push(format!("GET {url}"));
            Ok(HttpResponse {
                status: 200,
                url: url.to_string(),
                body: self.gateways.to_string(),
            })
        }

        async fn post(&self, url: &str, _timeout: Duration, _body: &Value) -> Result<HttpResponse> {
            self.calls.lock().unwrap().push(format!("POST {url}"));
            Ok(self.login.clone())
        }

        fn reset(&self) {
            *self.resets.lock().unwrap() += 1;
        }
    }

    #[tokio::test]
    async fn plant_from_redirect_target() {
        let t = Canned::new(200, "https://h/R2/Plant/Index/PL123?x=1", "<html>");
        let mut s = Session::new("https://h", "u", "p", None);
        assert_eq!(s.ensure_logged_in(&t, None).await.unwrap(), "PL123");
        assert!(s.is_logged_in());

        // Cached: no second handshake.
        s.ensure_logged_in(&t, None).await.unwrap();
        assert_eq!(t.calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn plant_from_json_body() {
        let t = Canned::new(
            200,
            "https://h/R2/Account/Login",
            r#"{"ok": true, "returnUrl": "/R2/PlantDashboard/Index/AB12"}"#,
        );
        let mut s = Session::new("https://h/", "u", "p", None);
        assert_eq!(s.ensure_logged_in(&t, None).await.unwrap(), "AB12");
        assert_eq!(s.base_url(), "https://h");
    }

    #[tokio::test]
    async fn missing_plant_is_auth_error() {
        let t = Canned::new(200, "https://h/R2/Account/Login", "{}");
        let mut s = Session::new("https://h", "u", "p", None);
        let err = s.ensure_logged_in(&t, None).await.unwrap_err();
        assert!(matches!(err, Error::Auth(_)));
        assert!(!s.is_logged_in());
    }

    #[tokio::test]
    async fn rejected_login_is_auth_error() {
        let t = Canned::new(401, "https://h/R2/Plant/Index/PL123", "");
        let mut s = Session::new("https://h", "u", "p", None);
        assert!(matches!(
            s.ensure_logged_in(&t, None).await,
            Err(Error::Auth(msg)) if msg.contains("401")
        ));
    }

    #[tokio::test]
    async fn configured_gateway_is_checked() {
        let t = Canned::new(200, "https://h/R2/Plant/Index/PL123", "");
        let mut ok = Session::new("https://h", "u", "p", Some("PL123"));
        assert_eq!(ok.ensure_logged_in(&t, None).await.unwrap(), "PL123");

        let mut wrong = Session::new("https://h", "u", "p", Some("NOPE1"));
        match wrong.ensure_logged_in(&t, None).await {
            Err(Error::GatewayMismatch { expected, found }) => {
                assert_eq!(expected, "NOPE1");
                assert_eq!(found, "PL123");
            }
            other => panic!("expected mismatch, got {other:?}"),
        }
        assert!(!wrong.is_logged_in());
    }

    #[tokio::test]
    async fn logout_resets_transport() {
        let t = Canned::new(200, "https://h/R2/Plant/Index/PL123", "");
        let mut s = Session::new("https://h", "u", "p", None);
        s.ensure_logged_in(&t, None).await.unwrap();
        s.logout(&t);
        assert!(s.plant().is_none());
        assert_eq!(*t.resets.lock().unwrap(), 1);
        s.ensure_logged_in(&t, None).await.unwrap();
        assert_eq!(t.calls.lock().unwrap().len(), 2);
    }
}
