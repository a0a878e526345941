use crate::error::NegotiationError;
use crate::peer::types::IceCandidate;
use std::collections::VecDeque;

/// Локальные кандидаты текущей сессии.
///
/// Пополняется до завершения сбора, затем замораживается и выдаётся ровно один раз.
/// Ничего не выдаётся, пока локальное описание не установлено.
#[derive(Debug, Default)]
pub struct CandidateBuffer {
    candidates: Vec<IceCandidate>,
    local_committed: bool,
    frozen: bool,
    drained: bool,
}

impl CandidateBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_local_committed(&mut self) {
        self.local_committed = true;
    }

    pub fn append(&mut self, candidate: IceCandidate) -> Result<(), NegotiationError> {
        if self.frozen {
            return Err(NegotiationError::Buffer(
                "append after discovery completed".into(),
            ));
        }
        self.candidates.push(candidate);
        Ok(())
    }

    pub fn freeze(&mut self) -> Result<(), NegotiationError> {
        if self.frozen {
            return Err(NegotiationError::Buffer("buffer already frozen".into()));
        }
        self.frozen = true;
        Ok(())
    }

    pub fn drain(&mut self) -> Result<Vec<IceCandidate>, NegotiationError> {
        if !self.frozen {
            return Err(NegotiationError::Buffer(
                "drain before discovery completed".into(),
            ));
        }
        if !self.local_committed {
            return Err(NegotiationError::Buffer(
                "drain before local description committed".into(),
            ));
        }
        if self.drained {
            return Err(NegotiationError::Buffer("buffer already drained".into()));
        }
        self.drained = true;
        Ok(std::mem::take(&mut self.candidates))
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }
}

/// Кандидаты собеседника, полученные до установки remote description
#[derive(Debug, Default)]
pub struct RemoteCandidateQueue {
    pending: VecDeque<String>,
    ready: bool,
}

impl RemoteCandidateQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend<I: IntoIterator<Item = String>>(&mut self, candidates: I) {
        self.pending.extend(candidates);
    }

    /// Remote description установлен, очередь можно применять
    pub fn mark_ready(&mut self) {
        self.ready = true;
    }

    /// Пусто, пока remote description не установлен.
    pub fn take_ready(&mut self) -> Vec<String> {
        if !self.ready {
            return Vec::new();
        }
        self.pending.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
