//! Loading of the area of interest from a GeoJSON file.
//!
//! Every polygon is normalised to a closed exterior ring of (longitude,
//! latitude) pairs in WGS84. Files produced by older GIS tools often carry the
//! pre-RFC 7946 `crs` member; the projected frames the acquisition areas are
//! usually drawn in (Web Mercator, NSIDC polar stereographic north) are
//! converted here, anything else is rejected.
use crate::error::{Error, Result};
use regex::Regex;
use serde_json::{json, Value};
use std::f64::consts::{FRAC_PI_2, FRAC_PI_4};
use std::fs;
use std::path::Path;
use tracing::{debug, info};

const WGS84_A: f64 = 6_378_137.0;
const WGS84_F: f64 = 1.0 / 298.257_223_563;

/// Reference frames an AOI file may be expressed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceCrs {
    Wgs84,
    WebMercator,
    PolarStereographicNorth,
}

impl SourceCrs {
    fn from_name(name: &str) -> Result<Self> {
        if name.contains("CRS84") {
            return Ok(Self::Wgs84);
        }
        let re = Regex::new(r"EPSG:{1,2}(?<code>\d+)").expect("Regex pattern should always compile");
        let code = re
            .captures(name)
            .and_then(|c| c.name("code"))
            .map(|m| m.as_str())
            .ok_or_else(|| Error::InvalidInput(format!("Unrecognised CRS name: {name}")))?;
        match code {
            "4326" => Ok(Self::Wgs84),
            "3857" | "900913" => Ok(Self::WebMercator),
            "3413" => Ok(Self::PolarStereographicNorth),
            other => Err(Error::InvalidInput(format!(
                "Unsupported CRS EPSG:{other}; reproject the AOI to EPSG:4326"
            ))),
        }
    }

    fn to_wgs84(self, x: f64, y: f64) -> (f64, f64) {
        match self {
            Self::Wgs84 => (x, y),
            Self::WebMercator => web_mercator_inverse(x, y),
            Self::PolarStereographicNorth => polar_stereographic_north_inverse(x, y),
        }
    }
}

/// One closed exterior ring in WGS84.
#[derive(Debug, Clone, PartialEq)]
pub struct Polygon {
    label: Option<String>,
    ring: Vec<(f64, f64)>,
}

impl Polygon {
    pub fn new(label: Option<String>, mut ring: Vec<(f64, f64)>) -> Result<Self> {
        if ring.iter().any(|(x, y)| !x.is_finite() || !y.is_finite()) {
            return Err(Error::InvalidInput(
                "Polygon contains a non-finite coordinate".to_string(),
            ));
        }
        if let (Some(first), Some(last)) = (ring.first().copied(), ring.last().copied()) {
            if first != last {
                ring.push(first);
            }
        }
        if ring.len() < 4 {
            return Err(Error::InvalidInput(format!(
                "Polygon ring has {} point(s), at least 4 are required",
                ring.len()
            )));
        }
        for &(lon, lat) in &ring {
            if !(-180.0..=180.0).contains(&lon) || !(-90.0..=90.0).contains(&lat) {
                return Err(Error::InvalidInput(format!(
                    "Coordinate ({lon}, {lat}) is outside WGS84 bounds"
                )));
            }
        }
        Ok(Self { label, ring })
    }

    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    pub fn ring(&self) -> &[(f64, f64)] {
        &self.ring
    }

    /// GeoJSON geometry object, as accepted by catalog search endpoints.
    pub fn to_geojson(&self) -> Value {
        let coords: Vec<[f64; 2]> = self.ring.iter().map(|&(x, y)| [x, y]).collect();
        json!({ "type": "Polygon", "coordinates": [coords] })
    }
}

/// Non-empty, immutable collection of AOI polygons.
#[derive(Debug, Clone, PartialEq)]
pub struct AreaOfInterest {
    polygons: Vec<Polygon>,
}

impl AreaOfInterest {
    pub fn new(polygons: Vec<Polygon>) -> Result<Self> {
        if polygons.is_empty() {
            return Err(Error::InvalidInput("AOI contains no polygons".to_string()));
        }
        Ok(Self { polygons })
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| {
            Error::InvalidInput(format!("Unable to read AOI file {}: {e}", path.display()))
        })?;
        let aoi = Self::from_geojson_str(&content)?;
        info!(path = %path.display(), polygons = aoi.len(), "Loaded AOI");
        Ok(aoi)
    }

    pub fn from_geojson_str(content: &str) -> Result<Self> {
        let doc: Value = serde_json::from_str(content)
            .map_err(|e| Error::InvalidInput(format!("AOI is not valid JSON: {e}")))?;

        let crs = match doc.pointer("/crs/properties/name").and_then(Value::as_str) {
            Some(name) => SourceCrs::from_name(name)?,
            None => SourceCrs::Wgs84,
        };
        debug!(?crs, "AOI source frame");

        let mut polygons = vec![];
        match doc.get("type").and_then(Value::as_str) {
            Some("FeatureCollection") => {
                let features = doc
                    .get("features")
                    .and_then(Value::as_array)
                    .ok_or_else(|| {
                        Error::InvalidInput("FeatureCollection has no 'features' array".to_string())
                    })?;
                if features.is_empty() {
                    return Err(Error::InvalidInput("AOI file contains no features".to_string()));
                }
                for feature in features {
                    collect_feature(feature, crs, &mut polygons)?;
                }
            }
            Some("Feature") => collect_feature(&doc, crs, &mut polygons)?,
            Some(_) => collect_geometry(&doc, None, crs, &mut polygons)?,
            None => {
                return Err(Error::InvalidInput(
                    "AOI document has no GeoJSON 'type'".to_string(),
                ))
            }
        }
        Self::new(polygons)
    }

    pub fn polygons(&self) -> &[Polygon] {
        &self.polygons
    }

    pub fn len(&self) -> usize {
        self.polygons.len()
    }

    /// Always false for a constructed AOI.
    pub fn is_empty(&self) -> bool {
        self.polygons.is_empty()
    }
}

fn collect_feature(feature: &Value, crs: SourceCrs, out: &mut Vec<Polygon>) -> Result<()> {
    let label = feature
        .pointer("/properties/tile_name")
        .and_then(Value::as_str)
        .map(str::to_string);
    let geometry = feature
        .get("geometry")
        .filter(|g| !g.is_null())
        .ok_or_else(|| Error::InvalidInput("Feature has no geometry".to_string()))?;
    collect_geometry(geometry, label, crs, out)
}

fn collect_geometry(
    geometry: &Value,
    label: Option<String>,
    crs: SourceCrs,
    out: &mut Vec<Polygon>,
) -> Result<()> {
    let coordinates = geometry.get("coordinates");
    match geometry.get("type").and_then(Value::as_str) {
        Some("Polygon") => {
            let rings = coordinates.ok_or_else(missing_coordinates)?;
            out.push(polygon_from_rings(rings, label, crs)?);
        }
        Some("MultiPolygon") => {
            let parts = coordinates
                .and_then(Value::as_array)
                .ok_or_else(missing_coordinates)?;
            for part in parts {
                out.push(polygon_from_rings(part, label.clone(), crs)?);
            }
        }
        Some("GeometryCollection") => {
            let geometries = geometry
                .get("geometries")
                .and_then(Value::as_array)
                .ok_or_else(|| {
                    Error::InvalidInput("GeometryCollection has no 'geometries'".to_string())
                })?;
            for g in geometries {
                collect_geometry(g, label.clone(), crs, out)?;
            }
        }
        Some(other) => {
            return Err(Error::InvalidInput(format!(
                "Unsupported AOI geometry type: {other}"
            )))
        }
        None => return Err(Error::InvalidInput("Geometry has no 'type'".to_string())),
    }
    Ok(())
}

fn missing_coordinates() -> Error {
    Error::InvalidInput("Geometry has no usable 'coordinates'".to_string())
}

/// Only the exterior ring (the first one) bounds the catalog query.
fn polygon_from_rings(rings: &Value, label: Option<String>, crs: SourceCrs) -> Result<Polygon> {
    let exterior = rings
        .as_array()
        .and_then(|r| r.first())
        .and_then(Value::as_array)
        .ok_or_else(missing_coordinates)?;
    let ring = exterior
        .iter()
        .map(|point| {
            let xy = point.as_array().filter(|p| p.len() >= 2);
            match xy.map(|p| (p[0].as_f64(), p[1].as_f64())) {
                Some((Some(x), Some(y))) => Ok(crs.to_wgs84(x, y)),
                _ => Err(Error::InvalidInput(format!("Malformed position: {point}"))),
            }
        })
        .collect::<Result<Vec<_>>>()?;
    Polygon::new(label, ring)
}

fn web_mercator_inverse(x: f64, y: f64) -> (f64, f64) {
    let lon = (x / WGS84_A).to_degrees();
    let lat = (2.0 * (y / WGS84_A).exp().atan() - FRAC_PI_2).to_degrees();
    (lon, lat)
}

/// Inverse of EPSG:3413 (polar stereographic north, true scale at 70°N,
/// central meridian 45°W) on the WGS84 ellipsoid.
fn polar_stereographic_north_inverse(x: f64, y: f64) -> (f64, f64) {
    let lon_0 = (-45.0_f64).to_radians();
    let lat_ts = 70.0_f64.to_radians();
    let e2 = WGS84_F * (2.0 - WGS84_F);
    let e = e2.sqrt();

    let rho = x.hypot(y);
    if rho == 0.0 {
        return (lon_0.to_degrees(), 90.0);
    }

    let sin_ts = lat_ts.sin();
    let m_c = lat_ts.cos() / (1.0 - e2 * sin_ts * sin_ts).sqrt();
    let t_c = (FRAC_PI_4 - lat_ts / 2.0).tan()
        / ((1.0 - e * sin_ts) / (1.0 + e * sin_ts)).powf(e / 2.0);
    let t = rho * t_c / (WGS84_A * m_c);

    // Conformal latitude, then the series expansion back to geodetic latitude
    let chi = FRAC_PI_2 - 2.0 * t.atan();
    let (e4, e6, e8) = (e2 * e2, e2 * e2 * e2, e2 * e2 * e2 * e2);
    let lat = chi
        + (e2 / 2.0 + 5.0 * e4 / 24.0 + e6 / 12.0 + 13.0 * e8 / 360.0) * (2.0 * chi).sin()
        + (7.0 * e4 / 48.0 + 29.0 * e6 / 240.0 + 811.0 * e8 / 11520.0) * (4.0 * chi).sin()
        + (7.0 * e6 / 120.0 + 81.0 * e8 / 1120.0) * (6.0 * chi).sin()
        + (4279.0 * e8 / 161_280.0) * (8.0 * chi).sin();
    let mut lon = lon_0 + x.atan2(-y);
    if lon < -std::f64::consts::PI {
        lon += 2.0 * std::f64::consts::PI;
    } else if lon > std::f64::consts::PI {
        lon -= 2.0 * std::f64::consts::PI;
    }
    (lon.to_degrees(), lat.to_degrees())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SQUARE: &str = r#"{
        "type": "FeatureCollection",
        "features": [
            {
                "type": "Feature",
                "properties": {"tile_name": "nwt_01"},
                "geometry": {
                    "type": "Polygon",
                    "coordinates": [[[-134.0, 68.0], [-133.0, 68.0], [-133.0, 69.0], [-134.0, 69.0], [-134.0, 68.0]]]
                }
            }
        ]
    }"#;

    /// Forward EPSG:3413 projection, used to check the inverse.
    fn polar_forward(lon: f64, lat: f64) -> (f64, f64) {
        let e2 = WGS84_F * (2.0 - WGS84_F);
        let e = e2.sqrt();
        let t_of = |phi: f64| {
            (FRAC_PI_4 - phi / 2.0).tan() / ((1.0 - e * phi.sin()) / (1.0 + e * phi.sin())).powf(e / 2.0)
        };
        let lat_ts = 70.0_f64.to_radians();
        let m_c = lat_ts.cos() / (1.0 - e2 * lat_ts.sin().powi(2)).sqrt();
        let rho = WGS84_A * m_c * t_of(lat.to_radians()) / t_of(lat_ts);
        let dl = (lon + 45.0).to_radians();
        (rho * dl.sin(), -rho * dl.cos())
    }

    #[test]
    fn test_load_feature_collection() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SQUARE.as_bytes()).unwrap();

        let aoi = AreaOfInterest::load(file.path()).unwrap();
        assert_eq!(aoi.len(), 1);
        assert!(!aoi.is_empty());
        let polygon = &aoi.polygons()[0];
        assert_eq!(polygon.label(), Some("nwt_01"));
        assert_eq!(polygon.ring().len(), 5);
        assert_eq!(polygon.ring().first(), polygon.ring().last());
    }

    #[test]
    fn test_open_ring_is_closed() {
        let geometry = r#"{"type": "Polygon", "coordinates": [[[0, 0], [1, 0], [1, 1], [0, 1]]]}"#;
        let aoi = AreaOfInterest::from_geojson_str(geometry).unwrap();
        assert_eq!(aoi.polygons()[0].ring().len(), 5);
    }

    #[test]
    fn test_multipolygon_parts_become_polygons() {
        let geometry = r#"{"type": "MultiPolygon", "coordinates": [
            [[[0, 0], [1, 0], [1, 1], [0, 0]]],
            [[[2, 2], [3, 2], [3, 3], [2, 2]]]
        ]}"#;
        let aoi = AreaOfInterest::from_geojson_str(geometry).unwrap();
        assert_eq!(aoi.len(), 2);
    }

    #[test]
    fn test_empty_and_malformed_inputs_are_rejected() {
        let empty = r#"{"type": "FeatureCollection", "features": []}"#;
        assert!(matches!(
            AreaOfInterest::from_geojson_str(empty),
            Err(Error::InvalidInput(_))
        ));
        assert!(matches!(
            AreaOfInterest::from_geojson_str("not json"),
            Err(Error::InvalidInput(_))
        ));
        let degenerate = r#"{"type": "Polygon", "coordinates": [[[0, 0], [1, 1], [0, 0]]]}"#;
        assert!(AreaOfInterest::from_geojson_str(degenerate).is_err());
        let point = r#"{"type": "Point", "coordinates": [0, 0]}"#;
        assert!(AreaOfInterest::from_geojson_str(point).is_err());
        assert!(AreaOfInterest::load("/nonexistent/aoi.geojson").is_err());
    }

    #[test]
    fn test_unsupported_crs_is_rejected() {
        let doc = r#"{
            "type": "Polygon",
            "crs": {"type": "name", "properties": {"name": "urn:ogc:def:crs:EPSG::32608"}},
            "coordinates": [[[0, 0], [1, 0], [1, 1], [0, 0]]]
        }"#;
        assert!(matches!(
            AreaOfInterest::from_geojson_str(doc),
            Err(Error::InvalidInput(_))
        ));
    }

    #[test]
    fn test_polar_stereographic_is_reprojected() {
        let corners = [(-134.0, 68.0), (-133.0, 68.0), (-133.0, 69.0), (-134.0, 68.0)];
        let projected: Vec<String> = corners
            .iter()
            .map(|&(lon, lat)| {
                let (x, y) = polar_forward(lon, lat);
                format!("[{x}, {y}]")
            })
            .collect();
        let doc = format!(
            r#"{{"type": "FeatureCollection",
                "crs": {{"type": "name", "properties": {{"name": "urn:ogc:def:crs:EPSG::3413"}}}},
                "features": [{{"type": "Feature", "properties": {{}},
                    "geometry": {{"type": "Polygon", "coordinates": [[{}]]}}}}]}}"#,
            projected.join(", ")
        );

        let aoi = AreaOfInterest::from_geojson_str(&doc).unwrap();
        for (&(lon, lat), &(rlon, rlat)) in corners.iter().zip(aoi.polygons()[0].ring()) {
            assert!((lon - rlon).abs() < 1e-6, "lon {lon} vs {rlon}");
            assert!((lat - rlat).abs() < 1e-6, "lat {lat} vs {rlat}");
        }
    }

    #[test]
    fn test_polar_origin_is_the_pole() {
        let (lon, lat) = polar_stereographic_north_inverse(0.0, 0.0);
        assert_eq!((lon, lat), (-45.0, 90.0));
    }

    #[test]
    fn test_web_mercator_is_reprojected() {
        let (lon, lat) = web_mercator_inverse(0.0, 0.0);
        assert!(lon.abs() < 1e-12 && lat.abs() < 1e-12);
        let (lon, _) = web_mercator_inverse(20_037_508.342_789_244, 0.0);
        assert!((lon - 180.0).abs() < 1e-9);
    }
}
