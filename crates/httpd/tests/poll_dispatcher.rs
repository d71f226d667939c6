mod common;

use micro_httpd::config::DispatcherKind;

const KIND: DispatcherKind = DispatcherKind::Poll;

#[test]
fn sync_response() {
    common::sync_response(KIND);
}

#[test]
fn large_body_upload() {
    common::large_body_upload(KIND);
}

#[test]
fn async_response() {
    common::async_response(KIND);
}

#[test]
fn disconnect_mid_body() {
    common::disconnect_mid_body(KIND);
}

#[test]
fn streamed_response() {
    common::streamed_response(KIND);
}

#[test]
fn keep_alive() {
    common::keep_alive(KIND);
}

#[test]
fn unread_body_is_skipped() {
    common::unread_body_is_skipped(KIND);
}

#[test]
fn expect_continue() {
    common::expect_continue(KIND);
}

#[test]
fn head_request() {
    common::head_request(KIND);
}

#[test]
fn rejected_requests() {
    common::rejected_requests(KIND);
}

#[test]
fn handler_panic() {
    common::handler_panic(KIND);
}

#[test]
fn idle_timeout() {
    common::idle_timeout(KIND);
}

#[test]
fn connection_limit() {
    common::connection_limit(KIND);
}

#[test]
fn stop_with_stuck_handler() {
    common::stop_with_stuck_handler(KIND);
}

#[test]
fn stop_refuses_new_requests() {
    common::stop_refuses_new_requests(KIND);
}

#[test]
fn websocket_echo() {
    common::websocket_echo(KIND);
}

#[test]
fn websocket_greeting() {
    common::websocket_greeting(KIND);
}
