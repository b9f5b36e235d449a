//! Great-circle distance, bounding-box helpers, and URI decoding.

pub const EARTH_RADIUS_KM: f64 = 6371.0;

/// Great-circle distance in kilometres between two points given in degrees.
pub fn haversine(lat_a: f64, lon_a: f64, lat_b: f64, lon_b: f64) -> f64 {
    let lat_a = lat_a.to_radians();
    let lat_b = lat_b.to_radians();
    let delta_lat = lat_b - lat_a;
    let delta_lon = lon_b.to_radians() - lon_a.to_radians();

    let sin_lat = (delta_lat / 2.0).sin();
    let sin_lon = (delta_lon / 2.0).sin();
    let a = sin_lat * sin_lat + lat_a.cos() * lat_b.cos() * sin_lon * sin_lon;
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());
    c * EARTH_RADIUS_KM
}

/// Degrees of latitude and longitude spanned by `dist` kilometres.
///
/// The cosine term takes the longitude, matching the deployed gateways this
/// one interoperates with. The resulting box only over-selects; callers
/// re-check candidates with the exact haversine distance.
pub fn dist_to_lat_lon(lon: f64, dist: f64) -> (f64, f64) {
    let ratio = dist / EARTH_RADIUS_KM;
    let delta_lat = ratio.to_degrees();
    let delta_lon = (delta_lat / lon.to_radians().cos()).abs();
    (delta_lat, delta_lon)
}

/// Decode a URI component: `+` as space, `%XX` byte escapes, and the legacy
/// `%uXXXX` form some station firmwares emit. Invalid escapes are left as-is.
pub fn decode_uri(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out: Vec<u8> = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b'%' => {
                if i + 5 < bytes.len() && (bytes[i + 1] == b'u' || bytes[i + 1] == b'U') {
                    if let Some(ch) = hex_u32(&bytes[i + 2..i + 6]).and_then(char::from_u32) {
                        let mut buf = [0u8; 4];
                        out.extend_from_slice(ch.encode_utf8(&mut buf).as_bytes());
                        i += 6;
                        continue;
                    }
                }
                if i + 2 < bytes.len() {
                    if let Some(byte) = hex_u32(&bytes[i + 1..i + 3]) {
                        out.push(byte as u8);
                        i += 3;
                        continue;
                    }
                }
                out.push(b'%');
                i += 1;
            }
            byte => {
                out.push(byte);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn hex_u32(digits: &[u8]) -> Option<u32> {
    if !digits.iter().all(u8::is_ascii_hexdigit) {
        return None;
    }
    let digits = std::str::from_utf8(digits).ok()?;
    u32::from_str_radix(digits, 16).ok()
}
