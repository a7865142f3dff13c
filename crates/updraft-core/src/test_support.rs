use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use updraft_backend::{HttpClient, NetworkError, SignatureIdentity, SignatureVerifier, VerifyError};

use crate::archive::ZipDecoder;
use crate::feed::Capabilities;
use crate::install::StaticTargets;

/// In-memory network: serves registered bodies, 404 for everything else.
#[derive(Default)]
pub(crate) struct FakeHttp {
    responses: Mutex<HashMap<String, Vec<u8>>>,
    requests: Mutex<Vec<String>>,
}

impl FakeHttp {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn respond(&self, url: &str, body: &[u8]) {
        self.responses
            .lock()
            .expect("responses lock should not be poisoned")
            .insert(url.to_string(), body.to_vec());
    }

    pub(crate) fn requests(&self, url: &str) -> usize {
        self.requests
            .lock()
            .expect("requests lock should not be poisoned")
            .iter()
            .filter(|requested| *requested == url)
            .count()
    }
}

#[async_trait]
impl HttpClient for FakeHttp {
    async fn get(&self, url: &str) -> Result<Vec<u8>, NetworkError> {
        self.requests
            .lock()
            .expect("requests lock should not be poisoned")
            .push(url.to_string());
        self.responses
            .lock()
            .expect("responses lock should not be poisoned")
            .get(url)
            .cloned()
            .ok_or_else(|| NetworkError::HttpStatus {
                url: url.to_string(),
                status: 404,
            })
    }
}

/// Accepts every artifact as signed by `test`.
pub(crate) struct AcceptAll;

impl SignatureVerifier for AcceptAll {
    fn verify(
        &self,
        _artifact: &Path,
        _installed: Option<&Path>,
    ) -> Result<SignatureIdentity, VerifyError> {
        Ok(SignatureIdentity("test".to_string()))
    }
}

pub(crate) fn capabilities() -> Capabilities {
    Capabilities {
        http: Arc::new(FakeHttp::new()),
        archive: Arc::new(ZipDecoder),
        verifier: Arc::new(AcceptAll),
        targets: Arc::new(StaticTargets(Vec::new())),
        relauncher: None,
    }
}
