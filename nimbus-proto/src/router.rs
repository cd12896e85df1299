//! Registered functions and variables, and dispatch of peer requests
//!
//! Application callbacks run behind a panic boundary: a misbehaving callback
//! produces an error response to the peer, never a crashed engine.

use std::panic::{self, AssertUnwindSafe};

use tracing::warn;

use crate::{
    error::ProtocolError,
    message::{app_error, Payload, Value},
    MAX_FUNCTION_ARG_LENGTH, MAX_KEY_LENGTH,
};

/// Callback invoked for a cloud-initiated function call
pub type FunctionHandler = Box<dyn FnMut(&str) -> i32 + Send>;

/// Typed reader producing the current value of a registered variable
pub enum VariableReader {
    /// Boolean variable
    Bool(Box<dyn Fn() -> bool + Send>),
    /// 32-bit integer variable
    Int(Box<dyn Fn() -> i32 + Send>),
    /// Double-precision variable
    Double(Box<dyn Fn() -> f64 + Send>),
    /// String variable
    Str(Box<dyn Fn() -> String + Send>),
}

impl VariableReader {
    fn type_byte(&self) -> u8 {
        match self {
            Self::Bool(_) => 0,
            Self::Int(_) => 1,
            Self::Double(_) => 2,
            Self::Str(_) => 3,
        }
    }

    fn read(&self) -> Result<Value, ()> {
        // Readers are application code; contain any panic
        panic::catch_unwind(AssertUnwindSafe(|| match self {
            Self::Bool(f) => Value::Bool(f()),
            Self::Int(f) => Value::Int(f()),
            Self::Double(f) => Value::Double(f()),
            Self::Str(f) => Value::Str(f()),
        }))
        .map_err(drop)
    }
}

struct Function {
    key: String,
    handler: FunctionHandler,
}

struct Variable {
    key: String,
    reader: VariableReader,
}

/// Fixed-capacity registries of application functions and variables
pub(crate) struct Router {
    functions: Vec<Function>,
    variables: Vec<Variable>,
    max_functions: usize,
    max_variables: usize,
}

impl Router {
    pub fn new(max_functions: usize, max_variables: usize) -> Self {
        Self {
            functions: Vec::new(),
            variables: Vec::new(),
            max_functions,
            max_variables,
        }
    }

    /// Register (or replace) a function under `key`
    pub fn register_function(
        &mut self,
        key: &str,
        handler: FunctionHandler,
    ) -> Result<(), ProtocolError> {
        if key.is_empty() || key.len() > MAX_KEY_LENGTH {
            return Err(ProtocolError::InsufficientStorage);
        }
        if let Some(existing) = self.functions.iter_mut().find(|f| f.key == key) {
            existing.handler = handler;
            return Ok(());
        }
        if self.functions.len() >= self.max_functions {
            return Err(ProtocolError::InsufficientStorage);
        }
        self.functions.push(Function {
            key: key.into(),
            handler,
        });
        Ok(())
    }

    /// Register (or replace) a variable under `key`
    pub fn register_variable(
        &mut self,
        key: &str,
        reader: VariableReader,
    ) -> Result<(), ProtocolError> {
        if key.is_empty() || key.len() > MAX_KEY_LENGTH {
            return Err(ProtocolError::InsufficientStorage);
        }
        if let Some(existing) = self.variables.iter_mut().find(|v| v.key == key) {
            existing.reader = reader;
            return Ok(());
        }
        if self.variables.len() >= self.max_variables {
            return Err(ProtocolError::InsufficientStorage);
        }
        self.variables.push(Variable {
            key: key.into(),
            reader,
        });
        Ok(())
    }

    /// Invoke the function registered under `key`, producing the response
    /// payload to send back
    pub fn call(&mut self, key: &str, arg: &str) -> Payload {
        if arg.len() > MAX_FUNCTION_ARG_LENGTH {
            return Payload::Error {
                code: app_error::BAD_REQUEST,
            };
        }
        let Some(function) = self.functions.iter_mut().find(|f| f.key == key) else {
            return Payload::Error {
                code: app_error::NOT_FOUND,
            };
        };
        match panic::catch_unwind(AssertUnwindSafe(|| (function.handler)(arg))) {
            Ok(value) => Payload::FunctionReturn { value },
            Err(_) => {
                warn!(key, "registered function panicked");
                Payload::Error {
                    code: app_error::INVOCATION_FAILED,
                }
            }
        }
    }

    /// Read the variable registered under `key`, producing the response
    /// payload to send back
    pub fn read(&self, key: &str) -> Payload {
        let Some(variable) = self.variables.iter().find(|v| v.key == key) else {
            return Payload::Error {
                code: app_error::NOT_FOUND,
            };
        };
        match variable.reader.read() {
            Ok(value) => Payload::VariableValue { value },
            Err(()) => {
                warn!(key, "variable reader panicked");
                Payload::Error {
                    code: app_error::INVOCATION_FAILED,
                }
            }
        }
    }

    /// Enumerate the registries for the peer
    pub fn describe(&self) -> Payload {
        Payload::Description {
            functions: self.functions.iter().map(|f| f.key.clone()).collect(),
            variables: self
                .variables
                .iter()
                .map(|v| (v.key.clone(), v.reader.type_byte()))
                .collect(),
        }
    }
}
