//! Manufacturer-id filter for advertisements.

use crate::advertisement::AdvertisementEvent;

/// Return the manufacturer payload for `target_id`, if the advertisement carries one.
///
/// `None` is the normal outcome for the unrelated advertisements that make up
/// most ambient traffic. An entry that is present but empty yields an empty
/// slice.
pub fn filter(event: &AdvertisementEvent, target_id: u16) -> Option<&[u8]> {
    event.manufacturer_data.get(&target_id).map(Vec::as_slice)
}
