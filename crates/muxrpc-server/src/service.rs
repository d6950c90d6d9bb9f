//! Service registration: mapping exported method names onto typed handler
//! closures over a receiver object.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use muxrpc_common::codec::CodecKind;
use muxrpc_common::error::{Result, RpcError};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::warn;

type Handler = Box<dyn Fn(CodecKind, &[u8]) -> Result<Vec<u8>> + Send + Sync>;

/// Returns true when a name is exported: it begins with an uppercase
/// letter, like `Foo` or `Sum`.
pub(crate) fn is_exported(name: &str) -> bool {
    name.chars().next().is_some_and(char::is_uppercase)
}

/// One remotely callable method: the erased handler plus its invocation
/// counter.
pub struct MethodType {
    handler: Handler,
    num_calls: Arc<AtomicU64>,
}

impl MethodType {
    /// Decodes the argument, invokes the handler and encodes the reply,
    /// all with the connection's negotiated codec.
    pub(crate) fn call(&self, kind: CodecKind, body: &[u8]) -> Result<Vec<u8>> {
        (self.handler)(kind, body)
    }

    /// Number of invocations so far, for introspection.
    pub fn num_calls(&self) -> u64 {
        self.num_calls.load(Ordering::Relaxed)
    }
}

/// A named collection of remotely callable methods over one receiver.
///
/// Method handlers have the shape
/// `Fn(&Receiver, Args, &mut Reply) -> anyhow::Result<()>`: two value
/// inputs besides the receiver and exactly one error output. The argument
/// type must be decodable and the reply type encodable and `Default`, so
/// the server can hand the handler a freshly shaped reply slot (maps and
/// sequences start out empty, not absent).
pub struct Service {
    name: String,
    methods: HashMap<String, Arc<MethodType>>,
}

impl Service {
    /// Starts building a service around a receiver object. The name should
    /// be the receiver type's exported name; `Server::register` rejects
    /// unexported names.
    pub fn build<T>(name: impl Into<String>, receiver: T) -> ServiceBuilder<T>
    where
        T: Send + Sync + 'static,
    {
        ServiceBuilder {
            name: name.into(),
            receiver: Arc::new(receiver),
            methods: HashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Looks a method up by its exported name.
    pub fn method(&self, name: &str) -> Option<&Arc<MethodType>> {
        self.methods.get(name)
    }

    /// Registered method names, sorted for stable output.
    pub fn method_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.methods.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Invocation count of one method, if it exists.
    pub fn num_calls(&self, method: &str) -> Option<u64> {
        self.methods.get(method).map(|m| m.num_calls())
    }
}

/// Builder collecting the eligible methods of a service.
pub struct ServiceBuilder<T> {
    name: String,
    receiver: Arc<T>,
    methods: HashMap<String, Arc<MethodType>>,
}

impl<T: Send + Sync + 'static> ServiceBuilder<T> {
    /// Adds a method. Methods with unexported names are filtered out with
    /// a warning, mirroring how ineligible methods are skipped rather than
    /// rejected.
    pub fn method<A, R, F>(mut self, name: impl Into<String>, f: F) -> Self
    where
        A: DeserializeOwned + Send + 'static,
        R: Serialize + Default + Send + 'static,
        F: Fn(&T, A, &mut R) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let name = name.into();
        if !is_exported(&name) {
            warn!(service = %self.name, method = %name, "rpc server: skipping unexported method");
            return self;
        }

        let receiver = Arc::clone(&self.receiver);
        let num_calls = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&num_calls);
        let handler: Handler = Box::new(move |kind, body| {
            let args: A = kind.decode_value(body)?;
            counter.fetch_add(1, Ordering::Relaxed);
            let mut reply = R::default();
            f(&receiver, args, &mut reply).map_err(|e| RpcError::Application(e.to_string()))?;
            kind.encode_value(&reply)
        });

        self.methods
            .insert(name, Arc::new(MethodType { handler, num_calls }));
        self
    }

    pub fn finish(self) -> Service {
        Service {
            name: self.name,
            methods: self.methods,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Serialize, Deserialize)]
    struct Args {
        num1: i32,
        num2: i32,
    }

    fn arith() -> Service {
        Service::build("Arith", ())
            .method("Sum", |_: &(), args: Args, reply: &mut i32| {
                *reply = args.num1 + args.num2;
                Ok(())
            })
            .method("Div", |_: &(), args: Args, reply: &mut i32| {
                if args.num2 == 0 {
                    anyhow::bail!("divide by zero");
                }
                *reply = args.num1 / args.num2;
                Ok(())
            })
            .finish()
    }

    fn encode_args(kind: CodecKind, num1: i32, num2: i32) -> Vec<u8> {
        kind.encode_value(&Args { num1, num2 }).unwrap()
    }

    #[test]
    fn test_eligible_methods_registered() {
        let svc = arith();
        assert_eq!(svc.name(), "Arith");
        assert_eq!(svc.method_names(), vec!["Div", "Sum"]);
    }

    #[test]
    fn test_unexported_method_filtered() {
        let svc = Service::build("Arith", ())
            .method("sum", |_: &(), _: Args, _: &mut i32| Ok(()))
            .finish();
        assert!(svc.method("sum").is_none());
        assert!(svc.method_names().is_empty());
    }

    #[test]
    fn test_call_round_trip() {
        let svc = arith();
        for kind in [CodecKind::Binary, CodecKind::Json] {
            let body = encode_args(kind, 3, 4);
            let reply = svc.method("Sum").unwrap().call(kind, &body).unwrap();
            let sum: i32 = kind.decode_value(&reply).unwrap();
            assert_eq!(sum, 7);
        }
    }

    #[test]
    fn test_handler_error_becomes_application_error() {
        let svc = arith();
        let kind = CodecKind::Binary;
        let body = encode_args(kind, 1, 0);
        let err = svc.method("Div").unwrap().call(kind, &body).unwrap_err();
        assert!(matches!(err, RpcError::Application(_)));
        assert!(err.to_string().contains("divide by zero"));
    }

    #[test]
    fn test_bad_argument_body_is_decode_error() {
        let svc = arith();
        let err = svc
            .method("Sum")
            .unwrap()
            .call(CodecKind::Json, b"not json")
            .unwrap_err();
        assert!(matches!(err, RpcError::JsonSerialization(_)));
    }

    #[test]
    fn test_num_calls_counts_invocations() {
        let svc = arith();
        let kind = CodecKind::Binary;
        assert_eq!(svc.num_calls("Sum"), Some(0));
        for i in 0..5 {
            let body = encode_args(kind, i, i);
            svc.method("Sum").unwrap().call(kind, &body).unwrap();
        }
        assert_eq!(svc.num_calls("Sum"), Some(5));
        // failed invocations count too; failed decodes do not
        let _ = svc.method("Div").unwrap().call(kind, &encode_args(kind, 1, 0));
        let _ = svc.method("Div").unwrap().call(CodecKind::Json, b"garbage");
        assert_eq!(svc.num_calls("Div"), Some(1));
        assert_eq!(svc.num_calls("Missing"), None);
    }

    #[test]
    fn test_reply_defaults_to_empty_containers() {
        let svc = Service::build("Listing", ())
            .method("Names", |_: &(), _: (), reply: &mut Vec<String>| {
                assert!(reply.is_empty());
                reply.push("a".to_string());
                Ok(())
            })
            .finish();
        let kind = CodecKind::Binary;
        let body = kind.encode_value(&()).unwrap();
        let reply = svc.method("Names").unwrap().call(kind, &body).unwrap();
        let names: Vec<String> = kind.decode_value(&reply).unwrap();
        assert_eq!(names, vec!["a".to_string()]);
    }

    #[test]
    fn test_receiver_state_is_shared() {
        use std::sync::atomic::AtomicI64;

        struct Counter {
            total: AtomicI64,
        }

        let svc = Service::build(
            "Counter",
            Counter {
                total: AtomicI64::new(0),
            },
        )
        .method("Add", |state: &Counter, n: i64, reply: &mut i64| {
            *reply = state.total.fetch_add(n, Ordering::SeqCst) + n;
            Ok(())
        })
        .finish();

        let kind = CodecKind::Binary;
        let add = |n: i64| -> i64 {
            let body = kind.encode_value(&n).unwrap();
            let reply = svc.method("Add").unwrap().call(kind, &body).unwrap();
            kind.decode_value(&reply).unwrap()
        };
        assert_eq!(add(2), 2);
        assert_eq!(add(3), 5);
    }
}
