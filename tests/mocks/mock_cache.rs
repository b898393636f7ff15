use futures::{Future, future};
use hyper::{self, Get, StatusCode};
use hyper::header::{ContentLength, ContentType};
use hyper::server::{Request, Response, Service};
use std::boxed::Box;
use std::cell::RefCell;
use std::rc::Rc;

/// Serves a fixed cache monitoring document and counts hits.
pub struct MockCache {
    pub hits: Rc<RefCell<u64>>,
}

impl Service for MockCache {
    type Request = Request;
    type Response = Response;
    type Error = hyper::Error;
    type Future = Box<Future<Item = Response, Error = hyper::Error>>;

    fn call(&self, req: Request) -> Self::Future {
        match req.method() {
            &Get => {
                *self.hits.borrow_mut() += 1;
                let body = r#"{"system": {"loadavg": 0.10, "speedMbps": 10000,
                                          "bytesIn": 1000, "bytesOut": 2000,
                                          "connections": 3, "http5xx": 0},
                               "stats": {"remap.bar.foo.example.out_bytes": 500}}"#
                    .to_owned();
                let rsp = Response::new()
                    .with_status(StatusCode::Ok)
                    .with_header(ContentType::json())
                    .with_header(ContentLength(body.len() as u64))
                    .with_body(body);
                future::ok(rsp).boxed()
            }
            _ => future::ok(Response::new().with_status(StatusCode::NotFound)).boxed(),
        }
    }
}
