/// Content-Format values
pub mod content_format;
pub use content_format::*;

/// Observe
pub mod observe;
pub use observe::*;

/// Block
pub mod block;
pub use block::*;

macro_rules! opt {
  (#[doc = $doc:expr] $name:ident = $n:literal) => {
    #[doc = $doc]
    #[allow(clippy::zero_prefixed_literal)]
    pub const $name: crate::OptNumber = crate::OptNumber($n);
  };
}

pub(crate) use opt;

/// Non-repeatable options
pub mod no_repeat {
  use super::opt;

  opt!(#[doc = "Uri-Host: the host of the resource being requested \
                (RFC7252 section 5.10.1)"]
       HOST = 3);
  opt!(#[doc = "If-None-Match: make a request conditional on the target \
                resource not existing (RFC7252 section 5.10.8.2)"]
       IF_NONE_MATCH = 5);
  opt!(#[doc = "Observe: register (0) or deregister (1) interest in \
                updates to a resource (RFC7641 section 2)"]
       OBSERVE = 6);
  opt!(#[doc = "Uri-Port: see [`HOST`]"]
       PORT = 7);
  opt!(#[doc = "Content-Format: the representation format of the payload \
                (RFC7252 section 5.10.3)"]
       CONTENT_FORMAT = 12);
  opt!(#[doc = "Max-Age: maximum time a response may be cached before it \
                is considered not fresh, in seconds; default 60 \
                (RFC7252 section 5.10.5)"]
       MAX_AGE = 14);
  opt!(#[doc = "Accept: which Content-Format is acceptable to the client \
                (RFC7252 section 5.10.4)"]
       ACCEPT = 17);
  opt!(#[doc = "Block2: descriptor of a block in a block-wise response \
                body transfer (RFC7959 section 2.2)"]
       BLOCK2 = 23);
  opt!(#[doc = "Block1: descriptor of a block in a block-wise request \
                body transfer (RFC7959 section 2.2)"]
       BLOCK1 = 27);
  opt!(#[doc = "Size2: total size of a block-wise response body, \
                advertised by the server (RFC7959 section 4)"]
       SIZE2 = 28);
  opt!(#[doc = "Proxy-Uri: absolute URI for forward-proxy requests \
                (RFC7252 section 5.10.2)"]
       PROXY_URI = 35);
  opt!(#[doc = "Proxy-Scheme: see [`PROXY_URI`]"]
       PROXY_SCHEME = 39);
  opt!(#[doc = "Size1: total size of a block-wise request body, \
                advertised by the client (RFC7252 section 5.10.9)"]
       SIZE1 = 60);
}

/// Repeatable options
pub mod repeat {
  use super::opt;

  opt!(#[doc = "If-Match: make a request conditional on the target \
                resource's current ETag (RFC7252 section 5.10.8.1)"]
       IF_MATCH = 1);
  opt!(#[doc = "ETag: an opaque identifier for a particular \
                representation of a resource (RFC7252 section 5.10.6)"]
       ETAG = 4);
  opt!(#[doc = "Location-Path: a path segment of the location of a \
                resource created by POST (RFC7252 section 5.10.7)"]
       LOCATION_PATH = 8);
  opt!(#[doc = "Uri-Path: a segment of the path of the resource being \
                requested; see [`super::no_repeat::HOST`]"]
       PATH = 11);
  opt!(#[doc = "Uri-Query: an argument parameterizing the resource; \
                see [`super::no_repeat::HOST`]"]
       QUERY = 15);
  opt!(#[doc = "Location-Query: see [`LOCATION_PATH`]"]
       LOCATION_QUERY = 20);
}
