use reqwest::blocking::{Body, Client, RequestBuilder, Response};
use reqwest::{Method, StatusCode, Url};
use std::fs::File;
use std::io;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

use crate::config::ObjectStoreConfig;
use crate::core::backend::mirror::write_atomically;
use crate::core::backend::{Backend, BackendError};
use crate::core::entry::EntryAttributes;

const STORAGE_CLASS_HEADER: &str = "x-amz-storage-class";
const MTIME_HEADER: &str = "x-amz-meta-mtime-ns";

/// Remote object store addressed as `<endpoint>/<bucket>/<relative path>`.
///
/// Every object is a single `PUT`, so the store only ever holds complete
/// files. In test-only mode, `setup_initial` still validates credentials and
/// connectivity but no object is written or deleted.
pub struct ObjectStoreBackend {
    name: String,
    endpoint: Url,
    bucket: String,
    access_token: Option<String>,
    reduced_redundancy: bool,
    test_only: bool,
    client: Client,
}

impl ObjectStoreBackend {
    pub fn new(config: &ObjectStoreConfig) -> Result<Self, BackendError> {
        let name = "object-store".to_string();

        let endpoint = Url::parse(&config.endpoint).map_err(|e| BackendError::Config {
            backend: name.clone(),
            message: format!("invalid endpoint '{}': {}", config.endpoint, e),
        })?;
        if endpoint.cannot_be_a_base() {
            return Err(BackendError::Config {
                backend: name,
                message: format!("endpoint '{}' cannot hold object paths", config.endpoint),
            });
        }
        if config.bucket.is_empty() {
            return Err(BackendError::Config {
                backend: name,
                message: "bucket name is empty".to_string(),
            });
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|source| BackendError::Request {
                backend: name.clone(),
                key: String::new(),
                source,
            })?;

        Ok(Self {
            name,
            endpoint,
            bucket: config.bucket.clone(),
            access_token: config.access_token.clone().filter(|t| !t.is_empty()),
            reduced_redundancy: config.reduced_redundancy,
            test_only: config.test_only,
            client,
        })
    }

    fn storage_class(&self) -> &'static str {
        if self.reduced_redundancy {
            "REDUCED_REDUNDANCY"
        } else {
            "STANDARD"
        }
    }

    /// URL of `key` inside the bucket; an empty key addresses the bucket.
    fn url_for(&self, key: &str) -> Url {
        let mut url = self.endpoint.clone();
        // cannot_be_a_base was rejected in new(), so segments are available
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty().push(&self.bucket);
            segments.extend(key.split('/').filter(|s| !s.is_empty()));
            if key.ends_with('/') {
                segments.push("");
            }
        }
        url
    }

    fn request(&self, method: Method, key: &str) -> RequestBuilder {
        let builder = self.client.request(method, self.url_for(key));
        match &self.access_token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    fn send(&self, builder: RequestBuilder, key: &str) -> Result<Response, BackendError> {
        builder.send().map_err(|source| BackendError::Request {
            backend: self.name.clone(),
            key: key.to_string(),
            source,
        })
    }

    fn check(&self, response: Response, key: &str) -> Result<Response, BackendError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(BackendError::Auth {
                backend: self.name.clone(),
                status: status.as_u16(),
            });
        }
        Err(BackendError::Status {
            backend: self.name.clone(),
            key: key.to_string(),
            status: status.as_u16(),
        })
    }

    fn delete_key(&self, key: &str) -> Result<(), BackendError> {
        if self.test_only {
            debug!(key = %key, "Test-only mode, skipping delete");
            return Ok(());
        }

        let response = self.send(self.request(Method::DELETE, key), key)?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        self.check(response, key).map(|_| ())
    }
}

impl Backend for ObjectStoreBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn destination(&self) -> String {
        self.url_for("").to_string()
    }

    fn is_test_only(&self) -> bool {
        self.test_only
    }

    fn setup_initial(&self) -> Result<(), BackendError> {
        let response = self.send(self.request(Method::HEAD, ""), "")?;
        self.check(response, "")?;

        if self.test_only {
            info!(destination = %self.destination(), "Object store credentials verified (test-only mode)");
        } else {
            debug!(destination = %self.destination(), "Object store reachable");
        }
        Ok(())
    }

    fn write_file(
        &self,
        relative_path: &str,
        source: &Path,
        attributes: &EntryAttributes,
    ) -> Result<u64, BackendError> {
        if self.test_only {
            debug!(key = %relative_path, "Test-only mode, skipping upload");
            return Ok(0);
        }

        let io_error = |source: io::Error| BackendError::Io {
            backend: self.name.clone(),
            path: relative_path.to_string(),
            source,
        };
        let file = File::open(source).map_err(io_error)?;
        let length = file.metadata().map_err(io_error)?.len();

        let builder = self
            .request(Method::PUT, relative_path)
            .header(STORAGE_CLASS_HEADER, self.storage_class())
            .header(MTIME_HEADER, attributes.modified_ns().to_string())
            .body(Body::sized(file, length));

        let response = self.send(builder, relative_path)?;
        self.check(response, relative_path)?;
        Ok(length)
    }

    fn delete_file(&self, relative_path: &str) -> Result<(), BackendError> {
        self.delete_key(relative_path)
    }

    /// Objects below a prefix are deleted one by one as files; only the
    /// folder marker object remains to be removed here.
    fn delete_purge(&self, prefix: &str) -> Result<(), BackendError> {
        self.delete_key(&format!("{}/", prefix.trim_end_matches('/')))
    }

    fn fetch_file(&self, relative_path: &str, target: &Path) -> Result<u64, BackendError> {
        let response = self.send(self.request(Method::GET, relative_path), relative_path)?;
        let mut response = self.check(response, relative_path)?;

        write_atomically(target, false, None, |writer| {
            response.copy_to(writer).map_err(io::Error::other)
        })
        .map_err(|source| BackendError::Io {
            backend: self.name.clone(),
            path: relative_path.to_string(),
            source,
        })
    }
}
