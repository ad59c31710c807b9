//! Minimal UTC time helpers.

use anyhow::Error;

pub use proxmox_time::epoch_i64;

/// Format an epoch timestamp as the compact ISO form used by AWS
/// signature v4 (`YYYYMMDDTHHMMSSZ`) plus its date-only prefix.
pub fn format_amz_date(epoch: i64) -> Result<(String, String), Error> {
    let stamp = proxmox_time::strftime_utc("%Y%m%dT%H%M%SZ", epoch)?;
    let date = proxmox_time::strftime_utc("%Y%m%d", epoch)?;
    Ok((stamp, date))
}

#[test]
fn test_format_amz_date() {
    // 2020-06-26T13:56:05Z
    let (stamp, date) = format_amz_date(1593179765).unwrap();
    assert_eq!(stamp, "20200626T135605Z");
    assert_eq!(date, "20200626");

    let (stamp, _) = format_amz_date(0).unwrap();
    assert_eq!(stamp, "19700101T000000Z");
}
