use once_cell::sync::Lazy;
use reqwest::Client;
use std::time::Duration;

// Image generation calls run long; the client-level timeout is a backstop
// and callers tighten it per request.
static HTTP_CLIENT: Lazy<Client> = Lazy::new(|| {
    Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .timeout(Duration::from_secs(180))
        .build()
        .expect("Failed to build HTTP client")
});

pub fn get_http_client() -> &'static Client {
    &HTTP_CLIENT
}
