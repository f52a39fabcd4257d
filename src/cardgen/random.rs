use rand::RngCore;

/// Largest multiple of 10 that fits in a byte's range.
const ACCEPT_BELOW: u8 = 250;

/// Random decimal digits drawn from the thread-local CSPRNG.
///
/// Bytes >= 250 are rejected so that `byte % 10` stays uniform over 0-9.
pub fn random_digits(count: usize) -> String {
    let mut out = String::with_capacity(count);
    let mut rng = rand::rng();
    let mut buf = [0u8; 64];

    while out.len() < count {
        rng.fill_bytes(&mut buf);
        for &b in buf.iter() {
            if out.len() == count {
                break;
            }
            if b < ACCEPT_BELOW {
                out.push(char::from(b'0' + b % 10));
            }
        }
    }

    out
}
