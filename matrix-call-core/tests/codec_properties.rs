//! Property tests for the call event codec

mod common;

use common::{raw_event, user, BOB};
use matrix_call_core::{decode, mangle_stream_ids, CallId, Candidate, PartyId, SignalEncoder, SignalMessage};
use proptest::prelude::*;
use std::collections::HashSet;

fn candidate_strategy() -> impl Strategy<Value = Candidate> {
    ("[a-z0-9 .:]{0,60}", 0u32..8, "[0-9a-z]{1,3}").prop_map(|(line, index, mid)| Candidate::new(line, index, mid))
}

proptest! {
    #[test]
    fn candidates_survive_the_wire(candidates in prop::collection::vec(candidate_strategy(), 0..6)) {
        let call_id = CallId::new("c1");
        let signal = SignalEncoder::default().candidates(&call_id, &PartyId::new("p1"), &candidates);
        let event = raw_event(&user(BOB), signal.event_type(), signal.content);

        let decoded = decode(&event).unwrap();
        prop_assert!(matches!(
            decoded.message,
            SignalMessage::Candidates(ref c) if c.candidates == candidates && c.call_id == call_id
        ));
    }

    #[test]
    fn stream_ids_are_unique_and_restorable(streams in prop::collection::hash_set("[a-z]{4,10}", 1..5)) {
        let sdp: String = streams
            .iter()
            .enumerate()
            .map(|(i, s)| format!("m=audio 9 RTP/SAVPF 111\r\na=msid:{s} track{i}\r\n"))
            .collect();

        let mangled = mangle_stream_ids(&sdp);
        let unique: HashSet<_> = mangled.stream_ids.iter().collect();
        prop_assert_eq!(unique.len(), streams.len());
        prop_assert_eq!(mangled.stream_ids.len(), streams.len());
        for stream in &streams {
            let needle = format!("msid:{stream} ");
            prop_assert!(!mangled.sdp.contains(&needle));
        }
        prop_assert_eq!(mangled.restore(&mangled.sdp), sdp);
    }
}
