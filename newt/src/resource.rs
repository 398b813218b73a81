//! Served resources: URI-path keyed handlers, discovery, and the
//! dispatch order inbound requests walk.
//!
//! Resources form a flat set keyed by exact path. Two wildcard
//! resources exist besides it: the *unknown-URI* resource (matches
//! any path with no exact entry) and the *proxy-URI* resource
//! (matches requests carrying Proxy-Uri/Proxy-Scheme). Dispatch
//! order is exact → unknown → proxy → 4.04.

use newt_msg::known::no_repeat::{PROXY_SCHEME, PROXY_URI};
use newt_msg::known::ContentFormat;
use newt_msg::{Code, Message};
use std_alloc::boxed::Box;
use std_alloc::collections::BTreeMap;
use std_alloc::string::String;
use std_alloc::vec::Vec;

use crate::net::Addrd;

/// Request methods (RFC 7252 section 12.1.1 + RFC 8132)
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[allow(missing_docs)]
pub enum Method {
  Get,
  Post,
  Put,
  Delete,
  Fetch,
  Patch,
  IPatch,
}

impl Method {
  /// The request code for this method
  pub fn code(&self) -> Code {
    match self {
      | Method::Get => Code::GET,
      | Method::Post => Code::POST,
      | Method::Put => Code::PUT,
      | Method::Delete => Code::DELETE,
      | Method::Fetch => Code::FETCH,
      | Method::Patch => Code::PATCH,
      | Method::IPatch => Code::IPATCH,
    }
  }

  /// Interpret a request code as a method
  pub fn from_code(code: Code) -> Option<Method> {
    match (code.class, code.detail) {
      | (0, 1) => Some(Method::Get),
      | (0, 2) => Some(Method::Post),
      | (0, 3) => Some(Method::Put),
      | (0, 4) => Some(Method::Delete),
      | (0, 5) => Some(Method::Fetch),
      | (0, 6) => Some(Method::Patch),
      | (0, 7) => Some(Method::IPatch),
      | _ => None,
    }
  }
}

/// What a handler wants sent back.
///
/// The runtime fills in message type, id, and token; the handler only
/// decides representation.
#[derive(Clone, Debug, PartialEq)]
pub struct Reply {
  /// Response code
  pub code: Code,
  /// Response body
  pub payload: Vec<u8>,
  /// Content-Format of the body, if any
  pub content_format: Option<ContentFormat>,
  /// ETag for the representation, if the handler versions it
  pub etag: Option<Vec<u8>>,
}

impl Reply {
  /// 2.05 Content with a body
  pub fn content(payload: impl Into<Vec<u8>>) -> Self {
    Self { code: crate::code::CONTENT,
           payload: payload.into(),
           content_format: None,
           etag: None }
  }

  /// An empty-bodied reply with `code`
  pub fn just(code: Code) -> Self {
    Self { code,
           payload: Vec::new(),
           content_format: None,
           etag: None }
  }

  /// Attach a Content-Format
  pub fn with_format(mut self, format: ContentFormat) -> Self {
    self.content_format = Some(format);
    self
  }

  /// Attach an ETag
  pub fn with_etag(mut self, etag: impl Into<Vec<u8>>) -> Self {
    self.etag = Some(etag.into());
    self
  }
}

/// A method handler: the full (addressed) request in, a [`Reply`] out
pub type Handler = Box<dyn FnMut(&Addrd<Message>) -> Reply>;

/// One served resource
pub struct Resource {
  path: String,
  handlers: BTreeMap<Method, Handler>,
  attrs: Vec<(String, String)>,
  discoverable: bool,
  observable: bool,
}

impl core::fmt::Debug for Resource {
  fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
    f.debug_struct("Resource")
     .field("path", &self.path)
     .field("methods", &self.handlers.keys().collect::<Vec<_>>())
     .field("observable", &self.observable)
     .finish()
  }
}

impl Resource {
  /// A resource at `path` with no handlers yet
  pub fn new(path: impl Into<String>) -> Self {
    Self { path: path.into(),
           handlers: BTreeMap::new(),
           attrs: Vec::new(),
           discoverable: true,
           observable: false }
  }

  /// The resource's path
  pub fn path(&self) -> &str {
    &self.path
  }

  /// Handle `method` with `handler`
  pub fn on(mut self, method: Method, handler: impl FnMut(&Addrd<Message>) -> Reply + 'static) -> Self {
    self.handlers.insert(method, Box::new(handler));
    self
  }

  /// Attach a Link-Format attribute (`rt`, `if`, `ct`, ..)
  pub fn attr(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
    self.attrs.push((key.into(), value.into()));
    self
  }

  /// Hide the resource from `.well-known/core`
  pub fn hidden(mut self) -> Self {
    self.discoverable = false;
    self
  }

  /// Mark the resource observable: GETs carrying Observe 0 register
  /// the sender for notifications
  pub fn observable(mut self) -> Self {
    self.observable = true;
    self
  }

  /// Whether the resource accepts observers
  pub fn is_observable(&self) -> bool {
    self.observable
  }

  /// Whether the resource shows up in discovery
  pub fn is_discoverable(&self) -> bool {
    self.discoverable
  }

  /// Invoke the handler for `method`, or `None` if the method is
  /// not supported (answer 4.05)
  pub fn handle(&mut self, method: Method, req: &Addrd<Message>) -> Option<Reply> {
    self.handlers.get_mut(&method).map(|h| h(req))
  }

  fn link_entry(&self) -> String {
    use core::fmt::Write;

    let mut s = String::new();
    write!(s, "</{}>", self.path).ok();
    for (k, v) in self.attrs.iter() {
      write!(s, ";{}=\"{}\"", k, v).ok();
    }
    if self.observable {
      s.push_str(";obs");
    }
    s
  }
}

/// Where a request landed in the dispatch order
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Matched {
  /// An exact-path resource
  Exact,
  /// The unknown-URI wildcard
  Unknown,
  /// The proxy-URI wildcard
  Proxy,
}

/// The flat resource set behind one endpoint.
#[derive(Debug, Default)]
pub struct Resources {
  by_path: BTreeMap<String, Resource>,
  unknown: Option<Resource>,
  proxy: Option<Resource>,
}

impl Resources {
  /// An empty set
  pub fn new() -> Self {
    Default::default()
  }

  /// Serve `resource` at its path, replacing any prior resource there
  pub fn add(&mut self, resource: Resource) {
    self.by_path.insert(resource.path.clone(), resource);
  }

  /// Install the unknown-URI wildcard
  pub fn set_unknown(&mut self, resource: Resource) {
    self.unknown = Some(resource);
  }

  /// Install the proxy-URI wildcard
  pub fn set_proxy(&mut self, resource: Resource) {
    self.proxy = Some(resource);
  }

  /// Remove the resource at `path`
  pub fn remove(&mut self, path: &str) -> Option<Resource> {
    self.by_path.remove(path)
  }

  /// Borrow the resource at `path` (exact matches only)
  pub fn get(&self, path: &str) -> Option<&Resource> {
    self.by_path.get(path)
  }

  /// Find the resource that should serve a request for `path`:
  /// exact match, then the unknown wildcard, then (for requests
  /// carrying proxy options) the proxy wildcard.
  pub fn lookup(&mut self, path: &str, msg: &Message) -> Option<(Matched, &mut Resource)> {
    if self.by_path.contains_key(path) {
      return self.by_path
                 .get_mut(path)
                 .map(|r| (Matched::Exact, r));
    }

    if let Some(unknown) = self.unknown.as_mut() {
      return Some((Matched::Unknown, unknown));
    }

    let proxied = msg.get_option(PROXY_URI).is_some() || msg.get_option(PROXY_SCHEME).is_some();
    if proxied {
      if let Some(proxy) = self.proxy.as_mut() {
        return Some((Matched::Proxy, proxy));
      }
    }

    None
  }

  /// The RFC 6690 Link-Format document enumerating discoverable
  /// resources, served at `.well-known/core`.
  pub fn well_known_core(&self) -> String {
    let mut entries = self.by_path
                          .values()
                          .filter(|r| r.discoverable)
                          .map(Resource::link_entry)
                          .collect::<Vec<_>>();
    entries.sort();
    entries.join(",")
  }

  /// Iterate the exact-path resources
  pub fn iter(&self) -> impl Iterator<Item = &Resource> {
    self.by_path.values()
  }

  /// Number of exact-path resources
  pub fn len(&self) -> usize {
    self.by_path.len()
  }

  /// Whether no resources are registered
  pub fn is_empty(&self) -> bool {
    self.by_path.is_empty()
  }
}

#[cfg(test)]
mod tests {
  use newt_msg::{Id, Token, Type};

  use super::*;
  use crate::test::dummy_addr;

  fn req(path: &str) -> Addrd<Message> {
    let mut msg = Message::new(Type::Con, Code::GET, Id(1), Token::empty());
    msg.set_path(path);
    Addrd(msg, dummy_addr())
  }

  #[test]
  fn dispatch_prefers_exact_match() {
    let mut resources = Resources::new();
    resources.add(Resource::new("time").on(Method::Get, |_| Reply::content("now")));
    resources.set_unknown(Resource::new("").on(Method::Get, |_| Reply::just(Code::new(4, 4))));

    let r = req("time");
    let (matched, resource) = resources.lookup("time", r.data()).unwrap();
    assert_eq!(matched, Matched::Exact);
    assert_eq!(resource.handle(Method::Get, &r).unwrap().payload, b"now");
  }

  #[test]
  fn dispatch_falls_back_to_unknown() {
    let mut resources = Resources::new();
    resources.set_unknown(Resource::new("").on(Method::Get, |_| Reply::content("?")));

    let r = req("nothing/here");
    let (matched, _) = resources.lookup("nothing/here", r.data()).unwrap();
    assert_eq!(matched, Matched::Unknown);
  }

  #[test]
  fn proxy_requests_reach_proxy_resource() {
    let mut resources = Resources::new();
    resources.set_proxy(Resource::new("").on(Method::Get, |_| Reply::content("fwd")));

    let mut r = req("elsewhere");
    r.data_mut()
     .set_option(PROXY_URI, *b"coap://other/x");

    let (matched, _) = resources.lookup("elsewhere", r.data()).unwrap();
    assert_eq!(matched, Matched::Proxy);

    // without proxy options there is no match at all
    let plain = req("elsewhere");
    assert!(resources.lookup("elsewhere", plain.data()).is_none());
  }

  #[test]
  fn unsupported_method_yields_none() {
    let mut resources = Resources::new();
    resources.add(Resource::new("time").on(Method::Get, |_| Reply::content("now")));

    let r = req("time");
    let (_, resource) = resources.lookup("time", r.data()).unwrap();
    assert!(resource.handle(Method::Put, &r).is_none());
  }

  #[test]
  fn well_known_core_lists_discoverable() {
    let mut resources = Resources::new();
    resources.add(Resource::new("time").on(Method::Get, |_| Reply::content("now"))
                                       .attr("rt", "clock")
                                       .observable());
    resources.add(Resource::new("secret").on(Method::Get, |_| Reply::content("shh"))
                                         .hidden());

    assert_eq!(resources.well_known_core(), "</time>;rt=\"clock\";obs");
  }
}
