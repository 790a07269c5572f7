//! Stream framing over an async reader

use ems_modbus::{Adu, MbapFramer, ProtocolError, Request};
use futures::StreamExt;
use tokio_util::codec::FramedRead;

fn frame(tid: u16, unit: u8, request: &Request) -> Vec<u8> {
    let pdu = request.to_pdu().expect("valid request");
    Adu::new(tid, unit, pdu).to_bytes().to_vec()
}

#[tokio::test]
async fn test_stream_yields_each_frame() {
    let mut wire = Vec::new();
    wire.extend(frame(1, 1, &Request::read(0x03, 0, 4).expect("read")));
    wire.extend(frame(2, 2, &Request::read(0x04, 10, 2).expect("read")));
    wire.extend(frame(
        3,
        3,
        &Request::WriteSingleRegister {
            address: 5,
            value: 42,
        },
    ));

    let mut reader = FramedRead::new(wire.as_slice(), MbapFramer);
    let mut tids = Vec::new();
    while let Some(item) = reader.next().await {
        let adu = Adu::decode(&item.expect("frame")).expect("valid adu");
        tids.push((adu.transaction_id, adu.unit_id, adu.pdu.function_code()));
    }

    assert_eq!(
        tids,
        vec![(1, 1, Some(0x03)), (2, 2, Some(0x04)), (3, 3, Some(0x06))]
    );
}

#[tokio::test]
async fn test_bad_frame_content_does_not_break_stream() {
    let mut bad = frame(7, 1, &Request::read(0x03, 0, 1).expect("read"));
    bad[2] = 0x12; // protocol id
    let good = frame(8, 1, &Request::read(0x03, 0, 1).expect("read"));

    let mut wire = bad;
    wire.extend(&good);

    let mut reader = FramedRead::new(wire.as_slice(), MbapFramer);

    let first = reader.next().await.expect("item").expect("framed");
    assert!(matches!(
        Adu::decode(&first),
        Err(ProtocolError::InvalidProtocolId(0x1200))
    ));

    let second = reader.next().await.expect("item").expect("framed");
    assert_eq!(Adu::decode(&second).expect("valid").transaction_id, 8);
}

#[tokio::test]
async fn test_truncated_tail_is_an_error() {
    let full = frame(9, 1, &Request::read(0x03, 0, 1).expect("read"));
    let truncated = &full[..full.len() - 2];

    let mut reader = FramedRead::new(truncated, MbapFramer);
    let item = reader.next().await.expect("item");
    assert!(item.is_err());
}
