/// Minimum IPv4 header length in bytes.
pub const IPV4_HDR_LEN: usize = 20;
/// Offset of the header checksum inside the IPv4 header.
pub const IPV4_CSUM_OFFSET: usize = 10;

/// RFC 1071: Internet checksum.
#[inline]
pub fn ip_checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    let mut i = 0;
    while i + 1 < data.len() {
        sum += u16::from_be_bytes([data[i], data[i + 1]]) as u32;
        i += 2;
    }
    if i < data.len() {
        sum += (data[i] as u32) << 8;
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !(sum as u16)
}

/// Header length announced by the version/IHL byte, never shorter than the
/// fixed header.
#[inline]
pub fn ipv4_header_len(ver_ihl: u8) -> usize {
    if ver_ihl == 0x45 {
        IPV4_HDR_LEN
    } else {
        (((ver_ihl & 0x0F) as usize) * 4).max(IPV4_HDR_LEN)
    }
}

/// Zero the checksum field of the IPv4 header starting at `offset` and write
/// the freshly computed one.
#[inline]
pub fn fix_ipv4_checksum(pkt: &mut [u8], offset: usize) {
    let avail = pkt.len() - offset;
    let hdr_len = ipv4_header_len(pkt[offset]).min(avail);
    let csum_at = offset + IPV4_CSUM_OFFSET;
    pkt[csum_at..csum_at + 2].fill(0);
    let csum = ip_checksum(&pkt[offset..offset + hdr_len]);
    pkt[csum_at..csum_at + 2].copy_from_slice(&csum.to_be_bytes());
}

/// True if the header at `offset` carries a valid checksum, i.e. summing the
/// whole header including the checksum field leaves no residual.
/// A header cut short by the end of the packet is summed up to that end;
/// nothing at or past the end verifies.
pub fn verify_ipv4_checksum(pkt: &[u8], offset: usize) -> bool {
    let Some(&ver_ihl) = pkt.get(offset) else {
        return false;
    };
    let hdr_len = ipv4_header_len(ver_ihl).min(pkt.len() - offset);
    ip_checksum(&pkt[offset..offset + hdr_len]) == 0
}
