//! Service descriptors and the handler registry.
//!
//! A [`Service`] maps method names to a [`MethodDescriptor`] (argument
//! fields, success type, declared exceptions) and a handler. It is built once
//! at startup and read-only afterwards.

use crate::context::RequestContext;
use crate::error::ServerError;
use futures::future::BoxFuture;
use rivet_protocol::{ApplicationException, Struct, TType, Value, UPGRADE_METHOD};
pub use rivet_protocol::SUCCESS_FIELD;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;

/// A declared argument field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldSpec {
    pub id: i16,
    pub name: String,
    pub ttype: TType,
}

/// A declared exception: the result field it populates and the error kind
/// bound to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExceptionSpec {
    pub id: i16,
    pub name: String,
    pub kind: String,
}

/// Signature of one method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodDescriptor {
    name: String,
    args: Vec<FieldSpec>,
    success: Option<TType>,
    exceptions: Vec<ExceptionSpec>,
    oneway: bool,
}

impl MethodDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            args: Vec::new(),
            success: None,
            exceptions: Vec::new(),
            oneway: false,
        }
    }

    /// A method that never produces a reply.
    pub fn oneway(name: impl Into<String>) -> Self {
        Self {
            oneway: true,
            ..Self::new(name)
        }
    }

    /// Declares the next argument.
    pub fn arg(mut self, id: i16, name: impl Into<String>, ttype: TType) -> Self {
        self.args.push(FieldSpec {
            id,
            name: name.into(),
            ttype,
        });
        self
    }

    /// Declares the success type. Methods without one return void.
    pub fn returns(mut self, ttype: TType) -> Self {
        self.success = Some(ttype);
        self
    }

    /// Declares an exception. Declarations are matched in order.
    pub fn throws(mut self, id: i16, name: impl Into<String>, kind: impl Into<String>) -> Self {
        self.exceptions.push(ExceptionSpec {
            id,
            name: name.into(),
            kind: kind.into(),
        });
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn args(&self) -> &[FieldSpec] {
        &self.args
    }

    pub fn success(&self) -> Option<TType> {
        self.success
    }

    pub fn exceptions(&self) -> &[ExceptionSpec] {
        &self.exceptions
    }

    pub fn is_oneway(&self) -> bool {
        self.oneway
    }

    /// Returns the first declared exception bound to `kind`.
    pub fn exception_for(&self, kind: &str) -> Option<&ExceptionSpec> {
        self.exceptions.iter().find(|exc| exc.kind == kind)
    }

    /// Pulls the declared arguments out of a request payload, in declaration
    /// order. Absent or mistyped fields become `None`; undeclared fields are
    /// dropped.
    pub fn extract_arguments(&self, mut body: Struct) -> Arguments {
        let values = self
            .args
            .iter()
            .map(|spec| {
                let value = body.take(spec.id).filter(|v| v.ttype() == spec.ttype);
                (spec.name.clone(), value)
            })
            .collect();
        Arguments { values }
    }

    fn validate(&self) -> Result<(), String> {
        if self.name == UPGRADE_METHOD {
            return Err(format!("method name '{}' is reserved", self.name));
        }
        let mut arg_ids = HashSet::new();
        for arg in &self.args {
            if !arg_ids.insert(arg.id) {
                return Err(format!("{}: duplicate argument id {}", self.name, arg.id));
            }
            if arg.ttype == TType::Stop {
                return Err(format!("{}: argument '{}' has no type", self.name, arg.name));
            }
        }
        let mut result_ids = HashSet::new();
        for exc in &self.exceptions {
            if exc.id == SUCCESS_FIELD {
                return Err(format!(
                    "{}: exception '{}' uses the success field id",
                    self.name, exc.name
                ));
            }
            if !result_ids.insert(exc.id) {
                return Err(format!("{}: duplicate exception id {}", self.name, exc.id));
            }
        }
        if self.oneway && (self.success.is_some() || !self.exceptions.is_empty()) {
            return Err(format!(
                "{}: oneway methods cannot return values or declare exceptions",
                self.name
            ));
        }
        Ok(())
    }
}

/// Arguments extracted for one call, in declaration order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Arguments {
    values: Vec<(String, Option<Value>)>,
}

impl Arguments {
    /// Returns the argument named `name`, if present and well typed.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values
            .iter()
            .find(|(n, _)| n == name)
            .and_then(|(_, v)| v.as_ref())
    }

    /// Takes the argument named `name` out.
    pub fn take(&mut self, name: &str) -> Option<Value> {
        self.values
            .iter_mut()
            .find(|(n, _)| n == name)
            .and_then(|(_, v)| v.take())
    }

    /// Returns the argument at a declaration position.
    pub fn at(&self, index: usize) -> Option<&Value> {
        self.values.get(index).and_then(|(_, v)| v.as_ref())
    }

    /// Number of declared arguments, present or not.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, Option<&Value>)> {
        self.values.iter().map(|(n, v)| (n.as_str(), v.as_ref()))
    }
}

/// Error returned by a handler.
#[derive(Debug, Clone, Error)]
pub enum HandlerError {
    /// An application error of a declared kind. Matched against the
    /// method's declared exceptions; on a match the payload is returned in a
    /// REPLY.
    #[error("unhandled exception: {kind}")]
    Declared { kind: String, payload: Struct },

    /// A protocol-native exception, written to the peer as is.
    #[error(transparent)]
    Application(#[from] ApplicationException),

    #[error("{0}")]
    Internal(String),
}

impl HandlerError {
    pub fn declared(kind: impl Into<String>, payload: Struct) -> Self {
        HandlerError::Declared {
            kind: kind.into(),
            payload,
        }
    }

    pub fn internal(message: impl fmt::Display) -> Self {
        HandlerError::Internal(message.to_string())
    }

    /// Converts an error that no declared exception matched into the
    /// exception sent to the peer.
    pub fn into_application_exception(self) -> ApplicationException {
        match self {
            HandlerError::Application(exc) => exc,
            other => ApplicationException::internal(other.to_string()),
        }
    }
}

/// Result of a handler: the success value, if the method returns one.
pub type HandlerResult = Result<Option<Value>, HandlerError>;

/// A method implementation.
pub trait Handler: Send + Sync + 'static {
    fn call(&self, context: RequestContext, args: Arguments) -> BoxFuture<'static, HandlerResult>;
}

impl<F, Fut> Handler for F
where
    F: Fn(RequestContext, Arguments) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    fn call(&self, context: RequestContext, args: Arguments) -> BoxFuture<'static, HandlerResult> {
        Box::pin(self(context, args))
    }
}

pub(crate) struct Method {
    pub(crate) descriptor: MethodDescriptor,
    pub(crate) handler: Arc<dyn Handler>,
}

/// An immutable registry of methods.
pub struct Service {
    name: String,
    methods: HashMap<String, Method>,
}

impl Service {
    pub fn builder(name: impl Into<String>) -> ServiceBuilder {
        ServiceBuilder {
            name: name.into(),
            methods: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn descriptor(&self, method: &str) -> Option<&MethodDescriptor> {
        self.methods.get(method).map(|m| &m.descriptor)
    }

    /// Method names, sorted.
    pub fn method_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.methods.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub(crate) fn method(&self, name: &str) -> Option<&Method> {
        self.methods.get(name)
    }
}

impl fmt::Debug for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Service")
            .field("name", &self.name)
            .field("methods", &self.method_names())
            .finish()
    }
}

/// Collects method registrations for a [`Service`].
pub struct ServiceBuilder {
    name: String,
    methods: Vec<Method>,
}

impl ServiceBuilder {
    /// Registers a handler for `descriptor`.
    pub fn method(mut self, descriptor: MethodDescriptor, handler: impl Handler) -> Self {
        self.methods.push(Method {
            descriptor,
            handler: Arc::new(handler),
        });
        self
    }

    /// Validates the registrations and freezes the registry.
    pub fn build(self) -> Result<Service, ServerError> {
        let mut methods = HashMap::with_capacity(self.methods.len());
        for method in self.methods {
            method
                .descriptor
                .validate()
                .map_err(ServerError::InvalidService)?;
            let name = method.descriptor.name().to_string();
            if methods.contains_key(&name) {
                return Err(ServerError::InvalidService(format!(
                    "method '{}' registered twice",
                    name
                )));
            }
            methods.insert(name, method);
        }
        Ok(Service {
            name: self.name,
            methods,
        })
    }
}
