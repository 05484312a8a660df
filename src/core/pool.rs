use std::collections::HashMap;

use tracing::debug;

use crate::driver::TransferHandle;

/// Per-host cache of idle transfer handles. Keying by host (rather than a
/// single shared stack) means a handle whose connection or session state
/// belongs to one origin is never reused against another.
pub(crate) struct HandlePool {
    stacks: HashMap<String, Vec<Box<dyn TransferHandle>>>,
    max_per_host: usize,
}

impl HandlePool {
    pub(crate) fn new(max_per_host: usize) -> Self {
        Self {
            stacks: HashMap::new(),
            max_per_host,
        }
    }

    /// Pops the most recently released handle for the host, if any.
    pub(crate) fn acquire(&mut self, host: &str) -> Option<Box<dyn TransferHandle>> {
        let stack = self.stacks.get_mut(host)?;
        let handle = stack.pop();
        if stack.is_empty() {
            self.stacks.remove(host);
        }
        handle
    }

    /// Returns a handle to the host's stack. The handle is reset first so a
    /// pooled handle never carries headers, auth, or body state from its
    /// previous transfer. With a cap of zero pooling is disabled and every
    /// release closes the handle.
    pub(crate) fn release(&mut self, mut handle: Box<dyn TransferHandle>, host: &str) {
        handle.reset();
        if self.max_per_host == 0 {
            handle.close();
            return;
        }

        let stack = self.stacks.entry(host.to_owned()).or_default();
        if stack.len() >= self.max_per_host {
            debug!(host, "handle pool full, closing released handle");
            handle.close();
            return;
        }
        stack.push(handle);
    }

    /// Shrinks every host stack to at most `max_per_host` entries, closing
    /// the excess.
    pub(crate) fn set_max_per_host(&mut self, max_per_host: usize) {
        self.max_per_host = max_per_host;
        self.stacks.retain(|_, stack| {
            while stack.len() > max_per_host {
                if let Some(mut handle) = stack.pop() {
                    handle.close();
                }
            }
            !stack.is_empty()
        });
    }

    pub(crate) fn close_all(&mut self) {
        for (_, stack) in self.stacks.drain() {
            for mut handle in stack {
                handle.close();
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn idle_count(&self, host: &str) -> usize {
        self.stacks.get(host).map_or(0, Vec::len)
    }
}

impl Drop for HandlePool {
    fn drop(&mut self) {
        self.close_all();
    }
}
