/// Docker module implements the sandbox runtime on top of the `docker` CLI.
/// Every call is a structured argv invocation; user payloads only ever
/// travel over stdin.
pub mod runtime;
