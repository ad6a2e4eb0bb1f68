use std::sync::Arc;

use tokio::sync::Mutex;

use courier_logging::courier_info;

use crate::executor::{ContentExtractor, StageExecutor, StageInput, StageOutcome};
use crate::persist::AtomicFileWriter;
use crate::transport::Transport;
use crate::types::StageError;

/// The fetch stage: drives a content extractor's requests through the
/// trusted-session transport, strictly one at a time in yielded order, and
/// writes every extracted item into the stage work directory.
pub struct FetchExecutor {
    transport: Mutex<Transport>,
    extractor: Arc<dyn ContentExtractor>,
}

impl FetchExecutor {
    pub fn new(transport: Transport, extractor: Arc<dyn ContentExtractor>) -> Self {
        Self {
            transport: Mutex::new(transport),
            extractor,
        }
    }
}

#[async_trait::async_trait]
impl StageExecutor for FetchExecutor {
    async fn execute(&self, input: StageInput) -> Result<StageOutcome, StageError> {
        let requests = self.extractor.start_requests(&input.channel);
        courier_info!(
            "fetch stage for channel '{}': {} request(s)",
            input.channel,
            requests.len()
        );

        let writer = AtomicFileWriter::new(input.work_dir.clone());
        let mut artifacts = Vec::new();
        // The lock spans the whole crawl: requests for one trusted session
        // are never interleaved.
        let mut transport = self.transport.lock().await;
        for request in &requests {
            let response = transport.send(request).await?;
            for item in self.extractor.parse(&response)? {
                let path = writer
                    .write(&item.filename, &item.bytes)
                    .map_err(|err| StageError::Executor(err.to_string()))?;
                artifacts.push(path);
            }
        }
        Ok(StageOutcome { artifacts })
    }
}
