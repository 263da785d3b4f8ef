//! Full two-peer scenarios, each driving a pair of [`kestrel::Connection`]s
//! wired together over an in-memory duplex pipe (see `common`). These mirror
//! the concrete end-to-end scenarios enumerated for the reentrant
//! coordinator: a plain round trip, a proxy introduction followed by a
//! reference back to it, a nested callback, a remote exception, and two
//! concurrent top-level requests sharing one connection.

mod common;

use common::{FnDispatcher, duplex_pipe};
use kestrel::{
    Connection, ConnectionBuilder, DispatchError, Error, LocalObject, ObjectId, ProxyFactory,
    ProxyIntroduction, RemoteError, RemoteProxy, Scalar, Value,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

const EVAL: u32 = 1;
const LEN: u32 = 2;
const APPLY: u32 = 3;
const CALL: u32 = 4;

struct TestList(Vec<i64>);

impl LocalObject for TestList {
    fn capability_mask(&self) -> u32 {
        0b1
    }
    fn proxy_kind(&self) -> ProxyIntroduction {
        ProxyIntroduction {
            kind: 1,
            args: None,
        }
    }
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

struct Callback {
    invoked: AtomicBool,
}

impl LocalObject for Callback {
    fn capability_mask(&self) -> u32 {
        0b10
    }
    fn proxy_kind(&self) -> ProxyIntroduction {
        ProxyIntroduction {
            kind: 2,
            args: None,
        }
    }
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

struct OpaqueProxy;
impl RemoteProxy for OpaqueProxy {}

struct TestProxyFactory;
impl ProxyFactory for TestProxyFactory {
    fn create(
        &self,
        _identity: ObjectId,
        _opmask: u32,
        _kind: u32,
        _args: Option<Value>,
        register: &mut dyn FnMut(Arc<dyn RemoteProxy>),
    ) -> Arc<dyn RemoteProxy> {
        let proxy: Arc<dyn RemoteProxy> = Arc::new(OpaqueProxy);
        register(proxy.clone());
        proxy
    }
}

fn expr_of(args: &Value) -> &str {
    match args {
        Value::Tuple(items) => match &items[0] {
            Value::Scalar(Scalar::Str(s)) => s.as_str(),
            _ => panic!("expected string argument"),
        },
        _ => panic!("expected tuple argument"),
    }
}

fn build_pair(
    dispatcher_i: impl kestrel::Dispatcher + 'static,
    dispatcher_r: impl kestrel::Dispatcher + 'static,
) -> (Connection, Connection) {
    let ((reader_i, writer_i), (reader_r, writer_r)) = duplex_pipe();
    let conn_i = ConnectionBuilder::new()
        .initiator(true)
        .dispatcher(Arc::new(dispatcher_i))
        .proxy_factory(Arc::new(TestProxyFactory))
        .build(reader_i, writer_i)
        .unwrap();
    let conn_r = ConnectionBuilder::new()
        .initiator(false)
        .dispatcher(Arc::new(dispatcher_r))
        .proxy_factory(Arc::new(TestProxyFactory))
        .build(reader_r, writer_r)
        .unwrap();
    (conn_i, conn_r)
}

#[test]
fn simple_evaluate() {
    let eval_i = FnDispatcher(|_code, _args, _conn| unreachable!("I receives no requests here"));
    let eval_r = FnDispatcher(|code, args, _conn| {
        assert_eq!(code, EVAL);
        match expr_of(&args) {
            "1+1" => Ok(Value::Scalar(Scalar::Int(2))),
            other => panic!("unexpected expr {other}"),
        }
    });
    let (conn_i, conn_r) = build_pair(eval_i, eval_r);

    std::thread::scope(|scope| {
        scope.spawn(|| {
            let _ = conn_r.serve_forever();
        });

        let args = Value::Tuple(vec![Value::Scalar(Scalar::Str("1+1".to_string()))]);
        let result = conn_i.send_request(EVAL, args).unwrap();
        match result {
            Value::Scalar(Scalar::Int(2)) => {}
            other => panic!("unexpected result {}", describe(&other)),
        }

        conn_i.close().unwrap();
    });
    conn_r.close().unwrap();
}

#[test]
fn proxy_introduction_and_reference_back() {
    let eval_i = FnDispatcher(|_code, _args, _conn| unreachable!());
    let eval_r = FnDispatcher(|code, args, _conn| match code {
        EVAL => match expr_of(&args) {
            "[1,2,3]" => Ok(Value::Object(Arc::new(TestList(vec![1, 2, 3])))),
            other => panic!("unexpected expr {other}"),
        },
        LEN => match args {
            Value::Tuple(items) => match &items[0] {
                Value::Object(obj) => {
                    let list = obj
                        .as_any()
                        .downcast_ref::<TestList>()
                        .expect("origin reference resolved to the original list");
                    Ok(Value::Scalar(Scalar::Int(list.0.len() as i64)))
                }
                other => panic!("expected an origin reference, got {}", describe(other)),
            },
            _ => panic!("expected tuple argument"),
        },
        other => panic!("unexpected code {other}"),
    });
    let (conn_i, conn_r) = build_pair(eval_i, eval_r);

    std::thread::scope(|scope| {
        scope.spawn(|| {
            let _ = conn_r.serve_forever();
        });

        let args = Value::Tuple(vec![Value::Scalar(Scalar::Str("[1,2,3]".to_string()))]);
        let list_value = conn_i.send_request(EVAL, args).unwrap();
        let proxy = match list_value {
            Value::Proxy(p) => p,
            other => panic!("expected a proxy, got {}", describe(&other)),
        };

        let len_args = Value::Tuple(vec![Value::Proxy(proxy)]);
        let len = conn_i.send_request(LEN, len_args).unwrap();
        match len {
            Value::Scalar(Scalar::Int(3)) => {}
            other => panic!("unexpected length {}", describe(&other)),
        }

        conn_i.close().unwrap();
    });
    conn_r.close().unwrap();
}

#[test]
fn nested_call_services_callback_before_outer_reply() {
    let invoked = Arc::new(AtomicBool::new(false));
    let invoked_for_i = invoked.clone();

    let dispatch_i = FnDispatcher(move |code, args, _conn| {
        assert_eq!(code, CALL, "only the nested callback lands on I");
        match args {
            Value::Tuple(items) => match &items[0] {
                Value::Object(obj) => {
                    let callback = obj
                        .as_any()
                        .downcast_ref::<Callback>()
                        .expect("origin reference resolves to the original callback");
                    callback.invoked.store(true, Ordering::SeqCst);
                    invoked_for_i.store(true, Ordering::SeqCst);
                    Ok(Value::Scalar(Scalar::Bool(true)))
                }
                other => panic!("expected origin reference, got {}", describe(other)),
            },
            _ => panic!("expected tuple"),
        }
    });

    let dispatch_r = FnDispatcher(move |code, args, conn| {
        assert_eq!(code, APPLY);
        match args {
            Value::Tuple(items) => match &items[0] {
                Value::Proxy(callback_proxy) => {
                    let result = conn
                        .send_request(CALL, Value::Tuple(vec![Value::Proxy(callback_proxy.clone())]))
                        .expect("nested call to I succeeds");
                    match result {
                        Value::Scalar(Scalar::Bool(true)) => {
                            Ok(Value::Scalar(Scalar::Str("applied".to_string())))
                        }
                        other => panic!("unexpected nested result {}", describe(&other)),
                    }
                }
                other => panic!("expected a proxy for the callback, got {}", describe(other)),
            },
            _ => panic!("expected tuple"),
        }
    });

    let (conn_i, conn_r) = build_pair(dispatch_i, dispatch_r);

    std::thread::scope(|scope| {
        scope.spawn(|| {
            let _ = conn_r.serve_forever();
        });

        let callback: Arc<dyn LocalObject> = Arc::new(Callback {
            invoked: AtomicBool::new(false),
        });
        let args = Value::Tuple(vec![Value::Object(callback)]);
        let result = conn_i.send_request(APPLY, args).unwrap();
        match result {
            Value::Scalar(Scalar::Str(s)) => assert_eq!(s, "applied"),
            other => panic!("unexpected result {}", describe(&other)),
        }
        assert!(invoked.load(Ordering::SeqCst), "callback must have run");

        conn_i.close().unwrap();
    });
    conn_r.close().unwrap();
}

#[test]
fn remote_exception_propagates_to_caller() {
    let eval_i = FnDispatcher(|_code, _args, _conn| unreachable!());
    let eval_r = FnDispatcher(|code, args, _conn| {
        assert_eq!(code, EVAL);
        match expr_of(&args) {
            "1/0" => Err(DispatchError::Failed(RemoteError::new("division by zero"))),
            other => panic!("unexpected expr {other}"),
        }
    });
    let (conn_i, conn_r) = build_pair(eval_i, eval_r);

    std::thread::scope(|scope| {
        scope.spawn(|| {
            let _ = conn_r.serve_forever();
        });

        let args = Value::Tuple(vec![Value::Scalar(Scalar::Str("1/0".to_string()))]);
        let err = conn_i.send_request(EVAL, args).unwrap_err();
        match err {
            Error::RemoteException(remote) => {
                assert!(remote.message.contains("division by zero"));
            }
            other => panic!("expected RemoteException, got {other:?}"),
        }

        conn_i.close().unwrap();
    });
    conn_r.close().unwrap();
}

#[test]
fn two_concurrent_top_level_requests_each_get_their_own_result() {
    let eval_i = FnDispatcher(|_code, _args, _conn| unreachable!());
    let eval_r = FnDispatcher(|code, args, _conn| {
        assert_eq!(code, EVAL);
        match expr_of(&args) {
            "2+2" => Ok(Value::Scalar(Scalar::Int(4))),
            "3+3" => Ok(Value::Scalar(Scalar::Int(6))),
            other => panic!("unexpected expr {other}"),
        }
    });
    let (conn_i, conn_r) = build_pair(eval_i, eval_r);

    std::thread::scope(|scope| {
        scope.spawn(|| {
            let _ = conn_r.serve_forever();
        });

        let (a, b) = std::thread::scope(|inner| {
            let h1 = inner.spawn(|| {
                let args = Value::Tuple(vec![Value::Scalar(Scalar::Str("2+2".to_string()))]);
                conn_i.send_request(EVAL, args).unwrap()
            });
            let h2 = inner.spawn(|| {
                let args = Value::Tuple(vec![Value::Scalar(Scalar::Str("3+3".to_string()))]);
                conn_i.send_request(EVAL, args).unwrap()
            });
            (h1.join().unwrap(), h2.join().unwrap())
        });

        match (a, b) {
            (Value::Scalar(Scalar::Int(4)), Value::Scalar(Scalar::Int(6))) => {}
            other => panic!(
                "unexpected results ({}, {})",
                describe(&other.0),
                describe(&other.1)
            ),
        }

        conn_i.close().unwrap();
    });
    conn_r.close().unwrap();
}

#[test]
fn closed_connection_refuses_new_requests() {
    // close() is idempotent, and every send_request issued afterwards (or
    // still in flight with nothing yet sent) must fail with
    // `ConnectionClosed` rather than hang waiting on a peer that will never
    // answer.
    let eval_i = FnDispatcher(|_code, _args, _conn| unreachable!());
    let eval_r = FnDispatcher(|_code, _args, _conn| unreachable!());
    let (conn_i, conn_r) = build_pair(eval_i, eval_r);

    conn_i.close().unwrap();
    conn_i.close().unwrap(); // idempotent

    let args = Value::Tuple(vec![Value::Scalar(Scalar::Str("noop".to_string()))]);
    let err = conn_i.send_request(EVAL, args).unwrap_err();
    assert!(matches!(err, Error::ConnectionClosed));

    conn_r.close().unwrap();
}

fn describe(v: &Value) -> String {
    match v {
        Value::Scalar(s) => format!("Scalar({s:?})"),
        Value::Tuple(items) => format!("Tuple({} items)", items.len()),
        Value::Object(_) => "Object(..)".to_string(),
        Value::Proxy(_) => "Proxy(..)".to_string(),
    }
}
