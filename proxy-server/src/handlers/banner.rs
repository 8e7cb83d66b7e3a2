/// Plaintext identity banner served on bare `GET /`.
pub const BANNER: &str = "idempotent-proxy";

pub async fn banner() -> &'static str {
    BANNER
}
