use std::sync::{Arc, OnceLock};

use anyhow::bail;
use tracing::debug;

use crate::message::Message;

pub type Callback = Box<dyn Fn(&mut Message) + Send + Sync>;

/// Routing tree for inbound messages.
///
/// Every registered leaf gets a *signature*: the root-to-leaf path of one-byte child
///  ids. Outbound messages embed the target leaf's signature in their header; routing
///  an inbound message decodes one id byte per tree level and invokes the leaf's
///  callback with the cursor left at the start of the payload.
///
/// The tree is built up front ([`MessageDispatcher::register`] /
///  [`MessageDispatcher::sub_handler`]) and then frozen by
///  [`MessageDispatcher::optimize`], which assigns the ids and signatures.
///  Registration after that point is a usage error.
pub struct MessageDispatcher {
    nodes: Vec<Node>,
    optimized: bool,
}

struct Node {
    children: Vec<usize>,
    callback: Option<Callback>,
    shared: Arc<HandlerShared>,
}

#[derive(Debug)]
struct HandlerShared {
    signature: OnceLock<Box<[u8]>>,
}

/// Cheap cloneable handle to a node in the dispatch tree. Branch handles are parents
///  for further registration; leaf handles address messages.
#[derive(Debug, Clone)]
pub struct Handler {
    node: usize,
    shared: Arc<HandlerShared>,
}

impl Handler {
    /// The root-to-leaf id path of this handler. Only leaves have one, and only after
    ///  the tree has been optimized.
    pub fn signature(&self) -> anyhow::Result<&[u8]> {
        match self.shared.signature.get() {
            Some(signature) => Ok(signature),
            None => bail!(
                "handler has no signature: it is a branch node, or the dispatch tree \
                 has not been optimized yet"
            ),
        }
    }
}

impl MessageDispatcher {
    pub fn new() -> MessageDispatcher {
        MessageDispatcher {
            nodes: vec![Node {
                children: Vec::new(),
                callback: None,
                shared: Arc::new(HandlerShared { signature: OnceLock::new() }),
            }],
            optimized: false,
        }
    }

    /// Handle for the root node, the default parent for registration.
    pub fn root(&self) -> Handler {
        Handler {
            node: 0,
            shared: self.nodes[0].shared.clone(),
        }
    }

    /// Adds a leaf below `parent` whose callback is invoked for messages carrying the
    ///  leaf's signature.
    pub fn register(&mut self, parent: &Handler, callback: Callback) -> anyhow::Result<Handler> {
        self.add_child(parent, Some(callback))
    }

    /// Adds a branch below `parent`, to group further handlers under a shared prefix.
    pub fn sub_handler(&mut self, parent: &Handler) -> anyhow::Result<Handler> {
        self.add_child(parent, None)
    }

    fn add_child(&mut self, parent: &Handler, callback: Option<Callback>) -> anyhow::Result<Handler> {
        if self.optimized {
            bail!("the dispatch tree is frozen: handlers cannot be registered after start");
        }
        if self.nodes[parent.node].callback.is_some() {
            bail!("cannot register below a leaf handler");
        }
        if self.nodes[parent.node].children.len() >= 256 {
            bail!("a handler cannot have more than 256 children");
        }

        let node = self.nodes.len();
        let shared = Arc::new(HandlerShared { signature: OnceLock::new() });
        self.nodes.push(Node {
            children: Vec::new(),
            callback,
            shared: shared.clone(),
        });
        self.nodes[parent.node].children.push(node);

        Ok(Handler { node, shared })
    }

    /// Freezes the tree: walks it depth-first, derives each child's one-byte id from
    ///  its index, and records the concatenated root-to-leaf path as each leaf's
    ///  signature.
    pub fn optimize(&mut self) -> anyhow::Result<()> {
        if self.optimized {
            bail!("the dispatch tree is already optimized");
        }
        self.optimized = true;

        let mut stack = vec![(0usize, Vec::new())];
        while let Some((node, prefix)) = stack.pop() {
            if self.nodes[node].callback.is_some() {
                // OnceLock is empty before optimize, so this cannot fail
                let _ = self.nodes[node].shared.signature.set(prefix.into_boxed_slice());
                continue;
            }
            for (index, &child) in self.nodes[node].children.iter().enumerate() {
                let mut child_prefix = prefix.clone();
                child_prefix.push(index as u8);
                stack.push((child, child_prefix));
            }
        }
        Ok(())
    }

    /// Routes `message` to the leaf its signature addresses and invokes the callback.
    ///  A truncated signature, an unknown id or an unregistered leaf drops the message
    ///  silently - inbound data must never panic or error into the receive loop.
    pub fn handle(&self, message: &mut Message) {
        let mut node = 0;
        loop {
            if let Some(callback) = &self.nodes[node].callback {
                callback(message);
                return;
            }
            if self.nodes[node].children.is_empty() {
                debug!("dropping message for an unregistered handler");
                return;
            }

            let id = match message.encoder.decode_u8() {
                Ok(id) => id,
                Err(_) => {
                    debug!("dropping message with a truncated handler signature");
                    return;
                }
            };
            match self.nodes[node].children.get(id as usize) {
                Some(&child) => node = child,
                None => {
                    debug!(id, "dropping message with an unknown handler id");
                    return;
                }
            }
        }
    }
}

impl Default for MessageDispatcher {
    fn default() -> Self {
        MessageDispatcher::new()
    }
}
