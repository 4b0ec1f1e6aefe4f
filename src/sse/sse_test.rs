use super::*;

#[test]
fn test_decodes_single_event() {
    let mut decoder = SseDecoder::new();
    let events = decoder.feed(b"event: message\ndata: {\"jsonrpc\":\"2.0\"}\n\n").unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event_type(), "message");
    assert_eq!(events[0].data, "{\"jsonrpc\":\"2.0\"}");
}

#[test]
fn test_joins_multiline_data() {
    let mut decoder = SseDecoder::new();
    let events = decoder.feed(b"data: a\ndata: b\n\n").unwrap();
    assert_eq!(events[0].data, "a\nb");
    assert_eq!(events[0].event, None);
}

#[test]
fn test_chunk_boundaries_anywhere() {
    let stream = b"event: endpoint\r\ndata: /messages?sessionId=abc\r\n\r\nid: 7\ndata: {\"x\":1}\n\n";

    // Feed one byte at a time; the result must match a single feed
    let mut whole = SseDecoder::new();
    let expected = whole.feed(stream).unwrap();

    let mut split = SseDecoder::new();
    let mut got = Vec::new();
    for b in stream.iter() {
        got.extend(split.feed(std::slice::from_ref(b)).unwrap());
    }

    assert_eq!(expected, got);
    assert_eq!(got.len(), 2);
    assert_eq!(got[0].event_type(), "endpoint");
    assert_eq!(got[0].data, "/messages?sessionId=abc");
    assert_eq!(got[1].id.as_deref(), Some("7"));
}

#[test]
fn test_comments_and_unknown_fields_ignored() {
    let mut decoder = SseDecoder::new();
    let events = decoder.feed(b": keepalive\n\nfoo: bar\ndata: x\n\n").unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].data, "x");
}

#[test]
fn test_event_without_data_is_not_dispatched() {
    let mut decoder = SseDecoder::new();
    assert!(decoder.feed(b"event: ping\n\n").unwrap().is_empty());
    // The event name does not leak into the next event
    let events = decoder.feed(b"data: y\n\n").unwrap();
    assert_eq!(events[0].event, None);
}

#[test]
fn test_finish_flushes_partial_event() {
    let mut decoder = SseDecoder::new();
    assert!(decoder.feed(b"data: tail").unwrap().is_empty());
    let event = decoder.finish().unwrap();
    assert_eq!(event.data, "tail");
    assert!(decoder.finish().is_none());
}

#[test]
fn test_line_decoder_preserves_raw_bytes() {
    let mut lines = LineDecoder::new();
    let out = lines.feed(b"data: one\r\ndata: two\npartial").unwrap();
    assert_eq!(out.len(), 2);
    assert_eq!(out[0].raw().as_ref(), b"data: one\r\n");
    assert_eq!(out[0].content(), b"data: one");
    assert_eq!(out[0].terminator(), b"\r\n");
    assert_eq!(out[1].terminator(), b"\n");
    assert_eq!(lines.pending(), 7);

    let tail = lines.finish().unwrap();
    assert_eq!(tail.content(), b"partial");
    assert!(tail.terminator().is_empty());
}

#[test]
fn test_unterminated_line_over_limit_fails() {
    let mut lines = LineDecoder::with_max_line(16);
    assert!(lines.feed(b"data: 0123").unwrap().is_empty());
    assert_eq!(lines.pending(), 10);

    // A terminated line of any length within one chunk is fine
    let out = lines.feed(b"456789abcdefghij\ndata: x").unwrap();
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].content(), b"data: 0123456789abcdefghij");
    assert_eq!(lines.pending(), 7);

    assert_eq!(
        lines.feed(b"yyyyyyyyyy"),
        Err(LineTooLong { limit: 16 })
    );
    assert_eq!(lines.pending(), 0);
}

#[test]
fn test_long_line_across_many_chunks() {
    let mut decoder = SseDecoder::with_max_line(64 * 1024);
    let payload = "x".repeat(40 * 1024);
    let frame = format!("data: {}\n\n", payload);

    let mut events = Vec::new();
    for chunk in frame.as_bytes().chunks(7) {
        events.extend(decoder.feed(chunk).unwrap());
    }
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].data, payload);

    let mut small = SseDecoder::with_max_line(1024);
    let overflow = frame
        .as_bytes()
        .chunks(100)
        .map(|chunk| small.feed(chunk))
        .find(Result::is_err);
    assert_eq!(overflow, Some(Err(LineTooLong { limit: 1024 })));
}

#[test]
fn test_parse_field_variants() {
    assert_eq!(parse_field(""), SseField::Blank);
    assert_eq!(parse_field(": hi"), SseField::Comment("hi"));
    assert_eq!(parse_field("event:endpoint"), SseField::Event("endpoint"));
    assert_eq!(parse_field("data:  two spaces"), SseField::Data(" two spaces"));
    assert_eq!(parse_field("retry: 3000"), SseField::Retry("3000"));
    assert_eq!(parse_field("data"), SseField::Data(""));
    assert_eq!(
        parse_field("x-custom: 1"),
        SseField::Other {
            name: "x-custom",
            value: "1"
        }
    );
}

#[test]
fn test_encode_roundtrips_through_decoder() {
    let event = SseEvent {
        event: Some("message".to_string()),
        data: "line1\nline2".to_string(),
        id: Some("42".to_string()),
        retry: None,
    };
    let encoded = event.encode();
    assert_eq!(
        encoded.as_ref(),
        b"id: 42\nevent: message\ndata: line1\ndata: line2\n\n"
    );

    let mut decoder = SseDecoder::new();
    assert_eq!(decoder.feed(&encoded).unwrap(), vec![event]);
}

#[test]
fn test_encode_comment() {
    assert_eq!(encode_comment("keepalive").as_ref(), b": keepalive\n\n");
}
