//! Piece selection.
//!
//! Stateless: each call works on the caller's snapshot of the owned bitmap
//! plus the shared in-flight set, so no lock is held while a candidate is
//! evaluated.
use super::InFlight;

/**
Selects the next piece to request from a peer: a piece the peer advertises
that we neither own nor are currently downloading elsewhere.

# How it works:
1. Scans byte-wise, skipping owned bytes of 0xFF outright.
2. In the first byte with anything to offer, takes the highest-order bit
   set in the peer's bitfield and clear in ours; the piece index is
   `8 * byte + bit` with bit 0 the MSB (the wire bitfield ordering).
3. A candidate that is already in flight is marked in the local snapshot
   and the scan resumes from the same byte instead of restarting, which
   keeps concurrent sessions from convoying onto one piece.
4. Padding bits at or past `piece_count` are treated as clear regardless
   of how the peer encoded them.

Returns `None` when the peer has nothing we still need.
*/
pub fn next_piece(
    peer_bits: &[u8],
    owned: &mut [u8],
    in_flight: &InFlight,
    piece_count: u32,
) -> Option<u32> {
    let bytes = peer_bits.len().min(owned.len());
    let mut i = 0;
    while i < bytes {
        if owned[i] == 0xFF {
            i += 1;
            continue;
        }
        let wanted = peer_bits[i] & !owned[i];
        if wanted == 0 {
            i += 1;
            continue;
        }

        let bit = wanted.leading_zeros();
        let index = i as u32 * 8 + bit;

        // provisional mark so the rescan moves on to the next candidate
        owned[i] |= 0x80u8 >> bit;

        if index < piece_count && !in_flight.contains(index) {
            return Some(index);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nothing_to_offer_when_equal() {
        let in_flight = InFlight::new();
        let peer = vec![0b1010_0000];
        let mut owned = vec![0b1010_0000];
        assert_eq!(next_piece(&peer, &mut owned, &in_flight, 8), None);
    }

    #[test]
    fn picks_highest_order_missing_bit() {
        let in_flight = InFlight::new();
        let peer = vec![0b0111_0000];
        let mut owned = vec![0b0100_0000];
        assert_eq!(next_piece(&peer, &mut owned, &in_flight, 8), Some(2));
    }

    #[test]
    fn skips_saturated_bytes() {
        let in_flight = InFlight::new();
        let peer = vec![0xFF, 0b0000_1000];
        let mut owned = vec![0xFF, 0b0000_0000];
        assert_eq!(next_piece(&peer, &mut owned, &in_flight, 16), Some(12));
    }

    #[test]
    fn dominating_peer_yields_a_bit_we_lack() {
        let in_flight = InFlight::new();
        let peer = vec![0b1111_1111];
        let mut owned = vec![0b1011_0110];
        let picked = next_piece(&peer, &mut owned.clone(), &in_flight, 8).unwrap();
        let mask = 0x80u8 >> picked;
        assert_ne!(peer[0] & mask, 0);
        assert_eq!(owned[0] & mask, 0);
    }

    #[test]
    fn in_flight_candidates_are_passed_over() {
        let in_flight = InFlight::new();
        in_flight.add(0);
        in_flight.add(1);
        let peer = vec![0b1110_0000];
        let mut owned = vec![0b0000_0000];
        assert_eq!(next_piece(&peer, &mut owned, &in_flight, 8), Some(2));
    }

    #[test]
    fn fully_in_flight_byte_falls_through_to_next() {
        let in_flight = InFlight::new();
        for index in 0..8 {
            in_flight.add(index);
        }
        let peer = vec![0xFF, 0b1000_0000];
        let mut owned = vec![0x00, 0x00];
        assert_eq!(next_piece(&peer, &mut owned, &in_flight, 16), Some(8));
    }

    #[test]
    fn padding_bits_are_ignored() {
        let in_flight = InFlight::new();
        // 10 pieces: bits 10..16 of the second byte are padding
        let peer = vec![0x00, 0b0011_1111];
        let mut owned = vec![0x00, 0x00];
        assert_eq!(next_piece(&peer, &mut owned, &in_flight, 10), None);

        let peer = vec![0x00, 0b0111_1111];
        let mut owned = vec![0x00, 0x00];
        assert_eq!(next_piece(&peer, &mut owned, &in_flight, 10), Some(9));
    }

    #[test]
    fn single_piece_torrent_terminates_after_one_selection() {
        let in_flight = InFlight::new();
        let peer = vec![0b1000_0000];
        let mut owned = vec![0x00];
        assert_eq!(next_piece(&peer, &mut owned, &in_flight, 1), Some(0));
        // the provisional mark means a retry on the same snapshot finds nothing
        assert_eq!(next_piece(&peer, &mut owned, &in_flight, 1), None);
    }
}
