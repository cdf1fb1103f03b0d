// Copyright 2025 LiveKit, Inc.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Fans every dispatched message out to all registered receivers. Receivers
/// that were dropped are pruned on the next dispatch.
#[derive(Clone, Debug)]
pub(crate) struct Dispatcher<T>
where
    T: Clone,
{
    senders: Arc<Mutex<Vec<mpsc::UnboundedSender<T>>>>,
}

impl<T> Default for Dispatcher<T>
where
    T: Clone,
{
    fn default() -> Self {
        Self { senders: Default::default() }
    }
}

impl<T> Dispatcher<T>
where
    T: Clone,
{
    pub fn register(&self) -> mpsc::UnboundedReceiver<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.senders.lock().push(tx);
        rx
    }

    pub fn dispatch(&self, msg: &T) {
        self.senders.lock().retain(|sender| sender.send(msg.clone()).is_ok());
    }

    pub fn clear(&self) {
        self.senders.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_dispatch_to_all() {
        let dispatcher = Dispatcher::<u32>::default();
        let mut a = dispatcher.register();
        let mut b = dispatcher.register();
        dispatcher.dispatch(&7);
        assert_eq!(a.recv().await, Some(7));
        assert_eq!(b.recv().await, Some(7));

        drop(a);
        dispatcher.dispatch(&8);
        assert_eq!(dispatcher.senders.lock().len(), 1);
        assert_eq!(b.recv().await, Some(8));

        dispatcher.clear();
        assert_eq!(b.recv().await, None);
    }
}
