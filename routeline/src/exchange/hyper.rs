use crate::exchange::{Exchange, ExchangeBuilderError};
use http_body_util::{BodyExt, Full};
use hyper::Request;
use hyper::body::{Bytes, Incoming};

/// Builds exchanges from hyper requests and turns them back into hyper responses.
pub struct HyperExchangeFactory;

impl HyperExchangeFactory {
    /// Collects the request body and copies the request head into a new [`Exchange`].
    pub async fn create_exchange(
        &self,
        request: Request<Incoming>,
    ) -> Result<Exchange, ExchangeBuilderError> {
        let (parts, body) = request.into_parts();
        let body_bytes = body
            .collect()
            .await
            .map_err(|e| ExchangeBuilderError::BodyRead(e.to_string()))?
            .to_bytes();
        let uri = parts
            .uri
            .path_and_query()
            .map(|path_and_query| path_and_query.as_str())
            .unwrap_or("/");
        Exchange::builder()
            .method(parts.method)
            .uri(uri)
            .header_map(parts.headers)
            .body(body_bytes.to_vec())
            .build()
    }

    /// Moves the exchange's response into a hyper response.
    pub fn into_response(&self, mut exchange: Exchange) -> hyper::Response<Full<Bytes>> {
        let body = exchange.response_mut().take_body().unwrap_or_default();
        let mut response = hyper::Response::new(Full::new(Bytes::from(body)));
        *response.status_mut() = exchange.response().status();
        *response.headers_mut() = exchange.response_mut().headers_mut().clone();
        response
    }
}
