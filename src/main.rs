use std::sync::Arc;

use async_trait::async_trait;
use kumo::body::KumoBody;
use kumo::config::KumoOptions;
use kumo::error::Result;
use kumo::gate::RequestContext;
use kumo::types::{Response, WorkerRequest};
use kumo::worker::WorkerInstance;

struct HelloWorker;

#[async_trait]
impl WorkerInstance for HelloWorker {
    async fn fetch(&self, req: WorkerRequest, _ctx: RequestContext) -> Result<Response> {
        Ok(Response::new(KumoBody::from(format!(
            "Hello from kumo: {}\n",
            req.uri().path()
        ))))
    }
}

#[tokio::main]
async fn main() {
    let options = KumoOptions::default();
    let listener = tokio::net::TcpListener::bind((options.host.clone(), options.port))
        .await
        .unwrap();
    kumo::serve(listener, kumo::Kumo::new(Arc::new(HelloWorker), options)).await;
}
