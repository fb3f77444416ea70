use std::sync::Arc;

use engine::ChallengeService;

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) service: Arc<ChallengeService>,
}
