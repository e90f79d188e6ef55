use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

/// Node in the diagnostic supervision tree.
///
/// A beacon links a component to its parent for observability; it does not
/// own the component. Cloning yields another handle to the same node.
#[derive(Clone)]
pub struct Beacon {
    node: Arc<Node>,
}

struct Node {
    label: String,
    parent: Option<Weak<Node>>,
    children: Mutex<Vec<Arc<Node>>>,
}

impl Node {
    fn children(&self) -> MutexGuard<'_, Vec<Arc<Node>>> {
        match self.children.lock() {
            Ok(g) => g,
            Err(poisoned) => {
                tracing::warn!(beacon = %self.label, "beacon lock was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }
}

impl fmt::Debug for Beacon {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Beacon").field("path", &self.path()).finish()
    }
}

impl Beacon {
    pub fn root(label: impl Into<String>) -> Self {
        Self {
            node: Arc::new(Node {
                label: label.into(),
                parent: None,
                children: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Create a child node and attach it under `self`.
    pub fn new_child(&self, label: impl Into<String>) -> Beacon {
        let child = Arc::new(Node {
            label: label.into(),
            parent: Some(Arc::downgrade(&self.node)),
            children: Mutex::new(Vec::new()),
        });
        self.node.children().push(child.clone());
        Beacon { node: child }
    }

    /// Detach this node from its parent. Idempotent.
    pub fn detach(&self) {
        if let Some(parent) = self.parent_node() {
            parent.children().retain(|c| !Arc::ptr_eq(c, &self.node));
        }
    }

    pub fn label(&self) -> &str {
        &self.node.label
    }

    pub fn is_attached(&self) -> bool {
        self.parent_node()
            .is_some_and(|p| p.children().iter().any(|c| Arc::ptr_eq(c, &self.node)))
    }

    /// Labels from the root down to this node, joined with `/`.
    pub fn path(&self) -> String {
        let mut labels = vec![self.node.label.clone()];
        let mut cur = self.parent_node();
        while let Some(node) = cur {
            labels.push(node.label.clone());
            cur = node.parent.as_ref().and_then(Weak::upgrade);
        }
        labels.reverse();
        labels.join("/")
    }

    pub fn children(&self) -> Vec<Beacon> {
        self.node
            .children()
            .iter()
            .map(|node| Beacon { node: node.clone() })
            .collect()
    }

    /// Report a failure of the component behind this beacon.
    pub fn report(&self, error: &dyn fmt::Display) {
        tracing::error!(beacon = %self.path(), error = %error, "component reported failure");
    }

    fn parent_node(&self) -> Option<Arc<Node>> {
        self.node.parent.as_ref().and_then(Weak::upgrade)
    }
}
