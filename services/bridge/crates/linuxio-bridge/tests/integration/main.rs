//! Bridge integration tests: real unix sockets, framed clients, test
//! handlers registered into an otherwise ordinary bridge state.

mod dispatch;
