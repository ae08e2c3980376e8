//! Per-request context.

use crate::trace::{ServerSpan, TraceInfo};
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;

/// Attachment point for request-scoped state.
///
/// A fresh context is created for every request. Collaborators attach
/// values keyed by type; the telemetry layer attaches the request's
/// [`ServerSpan`] and [`TraceInfo`].
#[derive(Default)]
pub struct RequestContext {
    extensions: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
}

impl RequestContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attaches a value, returning the previous value of the same type.
    pub fn insert<T: Send + Sync + 'static>(&mut self, value: T) -> Option<T> {
        self.extensions
            .insert(TypeId::of::<T>(), Box::new(value))
            .and_then(|prev| prev.downcast().ok().map(|boxed: Box<T>| *boxed))
    }

    pub fn get<T: Send + Sync + 'static>(&self) -> Option<&T> {
        self.extensions
            .get(&TypeId::of::<T>())
            .and_then(|value| value.downcast_ref())
    }

    pub fn get_mut<T: Send + Sync + 'static>(&mut self) -> Option<&mut T> {
        self.extensions
            .get_mut(&TypeId::of::<T>())
            .and_then(|value| value.downcast_mut())
    }

    pub fn remove<T: Send + Sync + 'static>(&mut self) -> Option<T> {
        self.extensions
            .remove(&TypeId::of::<T>())
            .and_then(|value| value.downcast().ok().map(|boxed: Box<T>| *boxed))
    }

    pub fn contains<T: Send + Sync + 'static>(&self) -> bool {
        self.extensions.contains_key(&TypeId::of::<T>())
    }

    /// The span of the request being served.
    pub fn span(&self) -> Option<&ServerSpan> {
        self.get::<ServerSpan>()
    }

    /// The trace the request belongs to.
    pub fn trace(&self) -> Option<&TraceInfo> {
        self.get::<TraceInfo>()
    }
}

impl fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestContext")
            .field("extensions", &self.extensions.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct UserId(u64);

    #[test]
    fn test_insert_get_remove() {
        let mut context = RequestContext::new();
        assert!(context.get::<UserId>().is_none());

        assert!(context.insert(UserId(1)).is_none());
        assert_eq!(context.insert(UserId(2)), Some(UserId(1)));
        assert_eq!(context.get::<UserId>(), Some(&UserId(2)));

        context.get_mut::<UserId>().unwrap().0 = 3;
        assert!(context.contains::<UserId>());
        assert_eq!(context.remove::<UserId>(), Some(UserId(3)));
        assert!(!context.contains::<UserId>());
    }

    #[test]
    fn test_values_keyed_by_type() {
        let mut context = RequestContext::new();
        context.insert(7u32);
        context.insert("label");
        assert_eq!(context.get::<u32>(), Some(&7));
        assert_eq!(context.get::<&str>(), Some(&"label"));
        assert!(context.span().is_none());
    }
}
