//! Stub HTTP Server
//!
//! A rule-driven stub server that answers HTTP requests with configured
//! responses. Use it to isolate software under test from the real services
//! it depends on.
//!
//! # Features
//!
//! - **Request Matching**: Match by method, path, headers, query params,
//!   body text, body file contents, or an XPath expression over an XML body
//! - **Fixture Responses**: Return literal text or the current contents of
//!   a file
//! - **Proxying**: Forward a request upstream and relay the reply
//! - **Overrides**: Set the status code and extra headers per rule
//! - **Ordered Rules**: The first rule that matches answers the request
//!
//! # Example Configuration
//!
//! ```yaml
//! rules:
//!   - description: hello world
//!     request:
//!       method: GET
//!       uri: /hello
//!     response:
//!       text: "Hello, World!"
//!       headers:
//!         content-type: text/plain
//!
//!   - request:
//!       uri: /orders
//!       xpath:
//!         expression: /order/id/text()
//!         value: "42"
//!     response:
//!       file: fixtures/order-42.xml
//!
//!   - response:
//!       proxy:
//!         url: http://localhost:8081/fallback
//! ```

pub mod config;
pub mod handler;
pub mod matcher;
pub mod proxy;
pub mod resolver;
pub mod server;

pub use config::StubServerConfig;
pub use handler::StubHandler;
pub use server::StubServer;
