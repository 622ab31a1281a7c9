use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

/// Per key in-flight request counter. An acquired slot is released when its
/// guard drops; entries disappear as soon as they reach zero.
pub struct ConnLimiter {
    limit: usize,
    active: Arc<Mutex<HashMap<String, usize>>>,
}

impl ConnLimiter {
    pub fn new(limit: usize) -> Self {
        ConnLimiter {
            limit,
            active: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn acquire(&self, key_id: &str) -> Option<ConnGuard> {
        let mut active = self.active.lock().unwrap();
        let count = active.get(key_id).copied().unwrap_or(0);
        if count >= self.limit {
            return None;
        }
        active.insert(key_id.to_string(), count + 1);
        Some(ConnGuard {
            key_id: key_id.to_string(),
            active: self.active.clone(),
        })
    }
}

pub struct ConnGuard {
    key_id: String,
    active: Arc<Mutex<HashMap<String, usize>>>,
}

impl Drop for ConnGuard {
    fn drop(&mut self) {
        let mut active = self.active.lock().unwrap();
        if let Some(count) = active.get_mut(&self.key_id) {
            *count -= 1;
            if *count == 0 {
                active.remove(&self.key_id);
            }
        }
    }
}
