use crate::session::SessionId;
use log::debug;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::sleep;

struct Pending {
    generation: u64,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct Inner {
    tasks: Mutex<HashMap<SessionId, Pending>>,
    next_generation: AtomicU64,
}

/// Отложенные повторы: не больше одной задачи на сессию.
///
/// Клонируется дёшево, клоны разделяют одну таблицу задач.
#[derive(Clone, Default)]
pub struct RetryScheduler {
    inner: Arc<Inner>,
}

impl RetryScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Запланировать `action` через `after`. Предыдущая задача сессии отменяется.
    /// Возвращает true, если была заменена ещё не сработавшая задача.
    pub fn schedule_retry<F>(&self, session: &SessionId, after: Duration, action: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let generation = self.inner.next_generation.fetch_add(1, Ordering::SeqCst);
        let inner = Arc::clone(&self.inner);
        let key = session.clone();

        // задача не может удалить свою запись раньше, чем та вставлена: lock удерживается
        let mut tasks = self.inner.tasks.lock();
        let handle = tokio::spawn(async move {
            sleep(after).await;
            {
                let mut tasks = inner.tasks.lock();
                match tasks.get(&key) {
                    Some(pending) if pending.generation == generation => {
                        tasks.remove(&key);
                    }
                    _ => return,
                }
            }
            debug!("[{key}] retry fired");
            action.await;
        });

        let replaced = tasks.insert(session.clone(), Pending { generation, handle });
        match replaced {
            Some(previous) => {
                previous.handle.abort();
                debug!("[{session}] pending retry replaced");
                true
            }
            None => false,
        }
    }

    /// Снять задачу сессии. true, если задача ещё ждала.
    pub fn cancel(&self, session: &SessionId) -> bool {
        match self.inner.tasks.lock().remove(session) {
            Some(pending) => {
                pending.handle.abort();
                debug!("[{session}] pending retry cancelled");
                true
            }
            None => false,
        }
    }

    pub fn is_pending(&self, session: &SessionId) -> bool {
        self.inner.tasks.lock().contains_key(session)
    }

    /// Число ожидающих задач по всем сессиям
    pub fn outstanding(&self) -> usize {
        self.inner.tasks.lock().len()
    }
}

impl std::fmt::Debug for RetryScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryScheduler")
            .field("outstanding", &self.outstanding())
            .finish()
    }
}
