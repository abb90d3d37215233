// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 takagi contributors

//! Middleware chain.
//!
//! An ordered list of request -> response transformers wrapping a terminal
//! dispatch (the router). Composition is right-to-left: the first layer
//! added sees the request first; the innermost call is the terminal. A
//! layer short-circuits by returning without invoking `next`.

use crate::message::{Request, Response};
use std::sync::Arc;

/// Continuation to the rest of the chain.
pub trait Next: Sync {
    /// Run the remaining layers and the terminal dispatch.
    fn run(&self, request: &Request) -> Response;
}

/// One middleware layer.
pub trait Middleware: Send + Sync {
    /// Transform the request/response, optionally invoking `next`.
    fn call(&self, request: &Request, next: &dyn Next) -> Response;
}

impl<F> Middleware for F
where
    F: Fn(&Request, &dyn Next) -> Response + Send + Sync,
{
    fn call(&self, request: &Request, next: &dyn Next) -> Response {
        self(request, next)
    }
}

/// Ordered middleware stack.
#[derive(Default, Clone)]
pub struct Chain {
    layers: Vec<Arc<dyn Middleware>>,
}

impl Chain {
    /// Empty chain.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a layer (outermost-first order).
    pub fn add(&mut self, layer: Arc<dyn Middleware>) {
        self.layers.push(layer);
    }

    /// Number of layers.
    pub fn len(&self) -> usize {
        self.layers.len()
    }

    /// True when no layers are installed.
    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// Run the request through every layer down to `terminal`.
    pub fn dispatch(&self, request: &Request, terminal: &dyn Next) -> Response {
        struct Link<'a> {
            rest: &'a [Arc<dyn Middleware>],
            terminal: &'a dyn Next,
        }

        impl Next for Link<'_> {
            fn run(&self, request: &Request) -> Response {
                match self.rest.split_first() {
                    Some((layer, rest)) => layer.call(
                        request,
                        &Link {
                            rest,
                            terminal: self.terminal,
                        },
                    ),
                    None => self.terminal.run(request),
                }
            }
        }

        Link {
            rest: &self.layers,
            terminal,
        }
        .run(request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Message, MessageType};
    use crate::protocol::constants as c;
    use std::sync::Mutex;

    struct Terminal;

    impl Next for Terminal {
        fn run(&self, request: &Request) -> Response {
            Response::for_request(request, c::CODE_CONTENT)
        }
    }

    fn request() -> Request {
        let mut msg = Message::udp(MessageType::Con, c::METHOD_GET, 9, vec![0x01]);
        msg.set_path("/ping");
        Request::new(msg, "192.0.2.1:5683".parse().unwrap())
    }

    #[test]
    fn test_empty_chain_hits_terminal() {
        let chain = Chain::new();
        let response = chain.dispatch(&request(), &Terminal);
        assert_eq!(response.code(), c::CODE_CONTENT);
    }

    #[test]
    fn test_layers_run_in_registration_order() {
        let order: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));
        let mut chain = Chain::new();

        let o = Arc::clone(&order);
        chain.add(Arc::new(move |req: &Request, next: &dyn Next| {
            o.lock().unwrap().push("outer");
            let response = next.run(req);
            o.lock().unwrap().push("outer-after");
            response
        }));
        let o = Arc::clone(&order);
        chain.add(Arc::new(move |req: &Request, next: &dyn Next| {
            o.lock().unwrap().push("inner");
            next.run(req)
        }));

        chain.dispatch(&request(), &Terminal);
        assert_eq!(
            *order.lock().unwrap(),
            vec!["outer", "inner", "outer-after"]
        );
    }

    #[test]
    fn test_short_circuit_skips_terminal() {
        let mut chain = Chain::new();
        chain.add(Arc::new(|req: &Request, _next: &dyn Next| {
            Response::for_request(req, c::CODE_FORBIDDEN)
        }));
        let response = chain.dispatch(&request(), &Terminal);
        assert_eq!(response.code(), c::CODE_FORBIDDEN);
    }
}
