//! Domain routing
//!
//! Tracks which error-isolation scope is active on the loop thread. Entering
//! pushes a scope, exiting pops it; with nothing entered the ambient scope set
//! by the script layer is active. The active scope is mirrored into a shared
//! slot so native handles registered through a [`LoopHandle`](super::LoopHandle)
//! capture the scope of the code that registered them.

use nodus_sdk::DomainRef;
use parking_lot::Mutex;
use std::sync::Arc;

/// Active-domain stack of one loop
pub struct DomainRouter {
    stack: Vec<DomainRef>,
    ambient: Option<DomainRef>,
    published: Arc<Mutex<Option<DomainRef>>>,
}

impl DomainRouter {
    /// Router publishing its active domain into `published`
    pub fn new(published: Arc<Mutex<Option<DomainRef>>>) -> Self {
        Self {
            stack: Vec::new(),
            ambient: None,
            published,
        }
    }

    /// Whether `domain` was disposed by the script layer
    pub fn is_disposed(&self, domain: &DomainRef) -> bool {
        domain.is_disposed()
    }

    /// Enter `domain` for the duration of one callback
    pub fn enter(&mut self, domain: &DomainRef) {
        domain.enter();
        self.stack.push(domain.clone());
        self.publish();
    }

    /// Leave `domain`, popping it from the stack
    pub fn exit(&mut self, domain: &DomainRef) {
        domain.exit();
        if let Some(pos) = self.stack.iter().rposition(|d| Arc::ptr_eq(d, domain)) {
            self.stack.remove(pos);
        }
        self.publish();
    }

    /// Innermost entered domain, else the ambient one
    pub fn active(&self) -> Option<&DomainRef> {
        self.stack.last().or(self.ambient.as_ref())
    }

    /// Set the ambient domain (`process.domain = d`)
    pub fn set_active(&mut self, domain: Option<DomainRef>) {
        self.ambient = domain;
        self.publish();
    }

    /// Nesting depth of entered domains
    pub fn depth(&self) -> usize {
        self.stack.len()
    }

    fn publish(&self) {
        *self.published.lock() = self.active().cloned();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nodus_sdk::Domain;
    use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};

    #[derive(Default)]
    struct TestDomain {
        depth: AtomicI32,
        disposed: AtomicBool,
    }

    impl Domain for TestDomain {
        fn is_disposed(&self) -> bool {
            self.disposed.load(Ordering::SeqCst)
        }
        fn enter(&self) {
            self.depth.fetch_add(1, Ordering::SeqCst);
        }
        fn exit(&self) {
            self.depth.fetch_sub(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_enter_exit_nests() {
        let published = Arc::new(Mutex::new(None));
        let mut router = DomainRouter::new(published.clone());
        let outer = Arc::new(TestDomain::default());
        let inner = Arc::new(TestDomain::default());
        let outer_ref: DomainRef = outer.clone();
        let inner_ref: DomainRef = inner.clone();

        router.enter(&outer_ref);
        router.enter(&inner_ref);
        assert_eq!(router.depth(), 2);
        assert!(Arc::ptr_eq(router.active().unwrap(), &inner_ref));
        assert!(published.lock().is_some());

        router.exit(&inner_ref);
        assert!(Arc::ptr_eq(router.active().unwrap(), &outer_ref));
        router.exit(&outer_ref);
        assert!(router.active().is_none());
        assert!(published.lock().is_none());

        assert_eq!(outer.depth.load(Ordering::SeqCst), 0);
        assert_eq!(inner.depth.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_ambient_domain_is_fallback() {
        let mut router = DomainRouter::new(Arc::new(Mutex::new(None)));
        let ambient: DomainRef = Arc::new(TestDomain::default());
        let entered: DomainRef = Arc::new(TestDomain::default());
        router.set_active(Some(ambient.clone()));
        assert!(Arc::ptr_eq(router.active().unwrap(), &ambient));
        router.enter(&entered);
        assert!(Arc::ptr_eq(router.active().unwrap(), &entered));
        router.exit(&entered);
        assert!(Arc::ptr_eq(router.active().unwrap(), &ambient));
    }

    #[test]
    fn test_is_disposed_asks_domain() {
        let router = DomainRouter::new(Arc::new(Mutex::new(None)));
        let domain = Arc::new(TestDomain::default());
        let domain_ref: DomainRef = domain.clone();
        assert!(!router.is_disposed(&domain_ref));
        domain.disposed.store(true, Ordering::SeqCst);
        assert!(router.is_disposed(&domain_ref));
    }
}
