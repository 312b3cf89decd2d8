//! Host-provided native functions and handlers.
//!
//! A [`Runtime`] is the set of callables a Flow program may reference.
//! The parser consults it to type-check call sites; the VM invokes the
//! registered closures through [`Params`]. Hosts register callables
//! with the builder returned by [`Runtime::register_function`] /
//! [`Runtime::register_handler`].

use crate::params::Params;
use flow_core::{LiteralType, Signature, Value};
use tracing::debug;

type NativeFn = Box<dyn Fn(&mut Params) + Send + Sync>;

/// Import hook: called once per `import` statement with the module
/// name and optional source path. Returns the builtins the module
/// contributes, or `None` to fail the import (and the parse).
pub type ImportHook =
    Box<dyn Fn(&str, Option<&str>) -> Option<Vec<NativeCallback>> + Send + Sync>;

/// One host-provided callable.
pub struct NativeCallback {
    signature: Signature,
    is_handler: bool,
    param_names: Vec<String>,
    defaults: Vec<Option<Value>>,
    sensitive: Vec<bool>,
    function: NativeFn,
}

impl NativeCallback {
    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    pub fn name(&self) -> &str {
        self.signature.name()
    }

    pub fn is_handler(&self) -> bool {
        self.is_handler
    }

    /// Whether the host supplied parameter names, enabling
    /// named-argument call sites.
    pub fn params_named(&self) -> bool {
        !self.param_names.is_empty()
    }

    pub fn param_name(&self, index: usize) -> Option<&str> {
        self.param_names.get(index).map(|s| s.as_str())
    }

    pub fn default_param(&self, index: usize) -> Option<&Value> {
        self.defaults.get(index).and_then(|d| d.as_ref())
    }

    pub fn is_param_sensitive(&self, index: usize) -> bool {
        self.sensitive.get(index).copied().unwrap_or(false)
    }

    pub fn invoke(&self, params: &mut Params) {
        (self.function)(params);
    }
}

impl std::fmt::Debug for NativeCallback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeCallback")
            .field("signature", &self.signature.to_string())
            .field("is_handler", &self.is_handler)
            .finish()
    }
}

/// Builder for one callable registration.
pub struct NativeBuilder<'r> {
    runtime: &'r mut Runtime,
    name: String,
    return_type: LiteralType,
    is_handler: bool,
    param_types: Vec<LiteralType>,
    param_names: Vec<String>,
    defaults: Vec<Option<Value>>,
    sensitive: Vec<bool>,
}

impl<'r> NativeBuilder<'r> {
    /// Appends a required parameter.
    pub fn param(mut self, ty: LiteralType, name: &str) -> Self {
        self.param_types.push(ty);
        self.param_names.push(name.to_string());
        self.defaults.push(None);
        self.sensitive.push(false);
        self
    }

    /// Appends a parameter with a default value; its type is the
    /// default's type.
    pub fn param_default(mut self, name: &str, default: Value) -> Self {
        self.param_types.push(default.ty());
        self.param_names.push(name.to_string());
        self.defaults.push(Some(default));
        self.sensitive.push(false);
        self
    }

    /// Marks the most recently added parameter as sensitive (target
    /// runtimes may redact it in traces).
    pub fn sensitive(mut self) -> Self {
        if let Some(last) = self.sensitive.last_mut() {
            *last = true;
        }
        self
    }

    /// Finalizes the registration with the native implementation.
    pub fn bind(self, function: impl Fn(&mut Params) + Send + Sync + 'static) {
        let callback = NativeCallback {
            signature: Signature::new(self.name, self.return_type, self.param_types),
            is_handler: self.is_handler,
            param_names: self.param_names,
            defaults: self.defaults,
            sensitive: self.sensitive,
            function: Box::new(function),
        };
        debug!(signature = %callback.signature(), "registering native callback");
        self.runtime.callbacks.push(callback);
    }
}

/// The registry of native callables plus the import hook.
#[derive(Default)]
pub struct Runtime {
    callbacks: Vec<NativeCallback>,
    import_hook: Option<ImportHook>,
}

impl Runtime {
    pub fn new() -> Self {
        Runtime::default()
    }

    /// Starts registering a native function with the given return
    /// type.
    pub fn register_function(&mut self, name: &str, return_type: LiteralType) -> NativeBuilder {
        NativeBuilder {
            runtime: self,
            name: name.to_string(),
            return_type,
            is_handler: false,
            param_types: Vec::new(),
            param_names: Vec::new(),
            defaults: Vec::new(),
            sensitive: Vec::new(),
        }
    }

    /// Starts registering a native handler. Handlers always yield the
    /// handled flag, so their return type is `Boolean`.
    pub fn register_handler(&mut self, name: &str) -> NativeBuilder {
        NativeBuilder {
            runtime: self,
            name: name.to_string(),
            return_type: LiteralType::Boolean,
            is_handler: true,
            param_types: Vec::new(),
            param_names: Vec::new(),
            defaults: Vec::new(),
            sensitive: Vec::new(),
        }
    }

    pub fn set_import_hook(&mut self, hook: ImportHook) {
        self.import_hook = Some(hook);
    }

    /// Resolves an `import` statement. Returns false to fail the
    /// parse. Without a hook, every import succeeds and contributes
    /// nothing.
    pub fn import(&mut self, name: &str, path: Option<&str>) -> bool {
        let Some(hook) = &self.import_hook else {
            return true;
        };
        match hook(name, path) {
            Some(builtins) => {
                self.callbacks.extend(builtins);
                true
            }
            None => false,
        }
    }

    pub fn callbacks(&self) -> &[NativeCallback] {
        &self.callbacks
    }

    pub fn callback(&self, index: usize) -> Option<&NativeCallback> {
        self.callbacks.get(index)
    }

    /// Finds a callable by name.
    pub fn find(&self, name: &str) -> Option<&NativeCallback> {
        self.callbacks.iter().find(|c| c.name() == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.find(name).is_some()
    }

    /// Finds the index of a callable with this exact signature and
    /// kind, for program linking.
    pub fn index_of(&self, signature: &Signature, is_handler: bool) -> Option<usize> {
        self.callbacks
            .iter()
            .position(|c| c.is_handler == is_handler && c.signature() == signature)
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("callbacks", &self.callbacks)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_find() {
        let mut runtime = Runtime::new();
        runtime
            .register_function("log", LiteralType::Void)
            .param(LiteralType::String, "message")
            .bind(|_| {});
        runtime.register_handler("pass").bind(|params| {
            params.set_handled(true);
        });

        assert!(runtime.contains("log"));
        assert!(runtime.contains("pass"));
        assert!(!runtime.contains("missing"));

        let log = runtime.find("log").unwrap();
        assert!(!log.is_handler());
        assert_eq!(log.signature().args(), &[LiteralType::String]);

        let pass = runtime.find("pass").unwrap();
        assert!(pass.is_handler());
        assert_eq!(pass.signature().return_type(), LiteralType::Boolean);
    }

    #[test]
    fn test_defaults_and_sensitivity() {
        let mut runtime = Runtime::new();
        runtime
            .register_function("connect", LiteralType::Boolean)
            .param(LiteralType::String, "host")
            .param_default("port", Value::Number(8080))
            .param(LiteralType::String, "token")
            .sensitive()
            .bind(|_| {});

        let cb = runtime.find("connect").unwrap();
        assert!(cb.params_named());
        assert_eq!(cb.param_name(1), Some("port"));
        assert_eq!(cb.default_param(0), None);
        assert_eq!(cb.default_param(1), Some(&Value::Number(8080)));
        assert!(!cb.is_param_sensitive(1));
        assert!(cb.is_param_sensitive(2));
    }

    #[test]
    fn test_import_hook_appends_builtins() {
        let mut runtime = Runtime::new();
        runtime.set_import_hook(Box::new(|name, _path| {
            if name != "acl" {
                return None;
            }
            let mut staging = Runtime::new();
            staging
                .register_function("acl.allow", LiteralType::Boolean)
                .param(LiteralType::IPAddress, "addr")
                .bind(|_| {});
            Some(staging.callbacks)
        }));

        assert!(runtime.import("acl", None));
        assert!(runtime.contains("acl.allow"));
        assert!(!runtime.import("unknown", Some("/etc/mods")));
    }

    #[test]
    fn test_index_of_requires_exact_signature() {
        let mut runtime = Runtime::new();
        runtime
            .register_function("max", LiteralType::Number)
            .param(LiteralType::Number, "a")
            .param(LiteralType::Number, "b")
            .bind(|_| {});

        let good = Signature::new(
            "max",
            LiteralType::Number,
            vec![LiteralType::Number, LiteralType::Number],
        );
        let bad = Signature::new("max", LiteralType::Number, vec![LiteralType::Number]);
        assert_eq!(runtime.index_of(&good, false), Some(0));
        assert_eq!(runtime.index_of(&good, true), None);
        assert_eq!(runtime.index_of(&bad, false), None);
    }
}
