//! Persisted form of the RUV. A RUV is stored as a multi-valued attribute, with one value
//! holding the replica generation and one value per replica:
//!
//! ```text
//! {replicageneration}:<generation>
//! <replica id>:<supplier url>[:<min csn>[:<max csn>]]
//! ```
//!
//! A single CSN means that min and max are equal. An element which has a max CSN but no min
//! one leaves the min field empty: `<replica id>:<supplier url>::<max csn>`. Supplier URLs may
//! contain colons of their own, so CSNs are recognized from the right end of the value. Last modification times are
//! stored in a separate attribute, as `<replica id>:<supplier url>:<hex timestamp>`.

use log::warn;
use smallvec::SmallVec;

use crate::csn::{Csn, CSN_STRSIZE};
use crate::ruv::{Ruv, RuvElement, RuvError};
use crate::{ReplicaId, Timestamp};

/// Name of the attribute holding RUV values.
pub const RUV_ATTRIBUTE: &str = "nsds50ruv";
/// Name of the attribute holding last modification times of RUV elements.
pub const LAST_MODIFIED_ATTRIBUTE: &str = "nsruvReplicaLastModified";

const GENERATION_TAG: &str = "{replicageneration}";

/// RUV parsed in a best-effort manner, together with a number of values which had to be
/// skipped because they were malformed or inconsistent.
#[derive(Debug, Clone)]
pub struct ParsedRuv {
    pub ruv: Ruv,
    pub skipped: usize,
}

enum Value {
    Generation(String),
    Element(RuvElement),
}

fn parse_value(value: &str) -> Result<Value, RuvError> {
    let bad_format = || RuvError::BadFormat(value.to_string());
    let (head, rest) = value.split_once(':').ok_or_else(bad_format)?;
    if head == GENERATION_TAG {
        return if rest.is_empty() {
            Err(bad_format())
        } else {
            Ok(Value::Generation(rest.to_string()))
        };
    }
    let rid: ReplicaId = head.parse().map_err(|_| bad_format())?;

    let mut url = rest;
    let mut csns: SmallVec<[Csn; 2]> = SmallVec::new();
    while csns.len() < 2 {
        match url.rsplit_once(':') {
            Some((prefix, tail)) if tail.len() == CSN_STRSIZE => match tail.parse::<Csn>() {
                Ok(csn) => {
                    csns.push(csn);
                    url = prefix;
                }
                Err(_) => break,
            },
            _ => break,
        }
    }

    let max_only = csns.len() == 1 && url.ends_with(':');
    if max_only {
        url = &url[..url.len() - 1];
    }

    let mut element = RuvElement::new(rid, url);
    match csns.as_slice() {
        [] => {}
        [csn] if max_only => element.max_csn = Some(*csn),
        [csn] => {
            element.min_csn = Some(*csn);
            element.max_csn = Some(*csn);
        }
        [max, min] => {
            if min > max {
                return Err(RuvError::BadData(format!(
                    "min csn {} exceeds max csn {} in '{}'",
                    min, max, value
                )));
            }
            element.min_csn = Some(*min);
            element.max_csn = Some(*max);
        }
        _ => return Err(bad_format()),
    }
    for csn in csns.iter() {
        if csn.replica_id() != rid {
            return Err(RuvError::BadData(format!("csn {} doesn't belong to replica {}", csn, rid)));
        }
    }
    Ok(Value::Element(element))
}

fn element_to_value(e: &RuvElement) -> String {
    match (e.min_csn, e.max_csn) {
        (Some(min), Some(max)) if min == max => format!("{}:{}:{}", e.replica_id, e.supplier_url, max),
        (Some(min), Some(max)) => format!("{}:{}:{}:{}", e.replica_id, e.supplier_url, min, max),
        (None, Some(max)) => format!("{}:{}::{}", e.replica_id, e.supplier_url, max),
        _ => format!("{}:{}", e.replica_id, e.supplier_url),
    }
}

impl Ruv {
    /// Serializes current RUV into attribute values, generation first and then replicas in
    /// their current order.
    pub fn to_values(&self) -> Vec<String> {
        let mut values = Vec::with_capacity(self.elements.len() + 1);
        if let Some(generation) = self.generation.as_ref() {
            values.push(format!("{}:{}", GENERATION_TAG, generation));
        }
        values.extend(self.elements.iter().map(element_to_value));
        values
    }

    /// Parses a RUV from its attribute values. Any malformed value fails the whole parse.
    pub fn from_values<I, S>(values: I) -> Result<Ruv, RuvError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut ruv = Ruv::new(None);
        for value in values {
            match parse_value(value.as_ref())? {
                Value::Generation(generation) => {
                    if ruv.generation.is_some() {
                        return Err(RuvError::BadData(format!("duplicate replica generation '{}'", generation)));
                    }
                    ruv.generation = Some(generation);
                }
                Value::Element(e) => {
                    let rid = e.replica_id;
                    ruv.push_element(e)
                        .map_err(|_| RuvError::BadData(format!("duplicate replica {}", rid)))?;
                }
            }
        }
        Ok(ruv)
    }

    /// Parses a RUV from its attribute values, skipping (and logging) the values which can't
    /// be used.
    pub fn from_values_lenient<I, S>(values: I) -> ParsedRuv
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut ruv = Ruv::new(None);
        let mut skipped = 0;
        for value in values {
            let value = value.as_ref();
            let result = parse_value(value).and_then(|parsed| match parsed {
                Value::Generation(generation) if ruv.generation.is_none() => {
                    ruv.generation = Some(generation);
                    Ok(())
                }
                Value::Generation(generation) => {
                    Err(RuvError::BadData(format!("duplicate replica generation '{}'", generation)))
                }
                Value::Element(e) => ruv.push_element(e),
            });
            if let Err(e) = result {
                warn!("skipping RUV value '{}': {}", value, e);
                skipped += 1;
            }
        }
        ParsedRuv { ruv, skipped }
    }

    /// Parses a RUV and checks if the element of a given replica carries a given supplier URL.
    pub fn init_from_values_and_check_url<I, S>(values: I, rid: ReplicaId, url: &str) -> Result<(Ruv, bool), RuvError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let ruv = Ruv::from_values(values)?;
        let matches = ruv.get_purl_for_replica(rid) == Some(url);
        Ok((ruv, matches))
    }

    /// Serializes last modification times of all elements.
    pub fn last_modified_values(&self) -> Vec<String> {
        self.elements
            .iter()
            .map(|e| format!("{}:{}:{:08x}", e.replica_id, e.supplier_url, e.last_modified))
            .collect()
    }

    /// Restores last modification times from their attribute values. Returns the number of
    /// values which were skipped, either because they were malformed or because they refer to
    /// a replica unknown to current RUV.
    pub fn apply_last_modified_values<I, S>(&mut self, values: I) -> usize
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut skipped = 0;
        for value in values {
            let value = value.as_ref();
            let parsed = value.split_once(':').and_then(|(rid, rest)| {
                let rid: ReplicaId = rid.parse().ok()?;
                let (_, time) = rest.rsplit_once(':')?;
                let time = Timestamp::from_str_radix(time, 16).ok()?;
                Some((rid, time))
            });
            match parsed.and_then(|(rid, time)| self.element_mut(rid).ok().map(|e| (e, time))) {
                Some((e, time)) => e.last_modified = time,
                None => {
                    warn!("skipping RUV last modified value '{}'", value);
                    skipped += 1;
                }
            }
        }
        skipped
    }
}

#[cfg(test)]
mod test {
    use crate::csn::Csn;
    use crate::ruv::{Ruv, RuvError};

    #[test]
    fn ruv_values_format() {
        let mut ruv = Ruv::new(Some("5a4b3c2d00000001".to_string()));
        ruv.set_max_csn(1, &Csn::new(200, 0, 1, 0), "ldap://a:389").unwrap();
        ruv.set_min_csn(1, &Csn::new(100, 0, 1, 0)).unwrap();
        ruv.set_max_csn(2, &Csn::new(300, 1, 2, 0), "ldap://b:389").unwrap();
        ruv.add_replica(3, "ldap://c:389").unwrap();

        assert_eq!(
            ruv.to_values(),
            vec![
                "{replicageneration}:5a4b3c2d00000001",
                "1:ldap://a:389:00000064000000010000:000000c8000000010000",
                "2:ldap://b:389:0000012c000100020000",
                "3:ldap://c:389",
            ]
        );
        assert_eq!(Ruv::from_values(ruv.to_values()), Ok(ruv));
    }

    #[test]
    fn ruv_values_empty_url() {
        let values = vec!["{replicageneration}:G1", "4::00000064000000040000", "5:"];
        let ruv = Ruv::from_values(&values).unwrap();
        assert_eq!(ruv.get_purl_for_replica(4), Some(""));
        assert_eq!(ruv.get_max_csn(4), Ok(Csn::new(100, 0, 4, 0)));
        assert_eq!(ruv.get_purl_for_replica(5), Some(""));
        assert_eq!(ruv.to_values(), values);
    }

    #[test]
    fn ruv_values_max_without_min() {
        let mut ruv = Ruv::init_new("G1", 1, "ldap://a:389");
        let (c1, c2) = (Csn::new(100, 0, 2, 0), Csn::new(101, 0, 2, 0));
        ruv.add_csn_inprogress(&c1).unwrap();
        ruv.add_csn_inprogress(&c2).unwrap();
        ruv.update_ruv(&c2, "", false).unwrap();
        ruv.cancel_csn_inprogress(&c1).unwrap();
        assert_eq!(ruv.get_max_csn(2), Ok(c2));
        assert_eq!(ruv.get_min_csn(2), Err(RuvError::NotFound(2)));

        let values = ruv.to_values();
        assert_eq!(values[2], "2:::00000065000000020000");
        let loaded = Ruv::from_values(&values).unwrap();
        assert_eq!(loaded, ruv);
        assert_eq!(loaded.get_purl_for_replica(2), Some(""));
        assert_eq!(loaded.covers_csn(&c2), ruv.covers_csn(&c2));

        let with_url = vec!["3:ldap://c:389::00000064000000030000"];
        let loaded = Ruv::from_values(&with_url).unwrap();
        assert_eq!(loaded.get_purl_for_replica(3), Some("ldap://c:389"));
        assert_eq!(loaded.get_min_csn(3), Err(RuvError::NotFound(3)));
        assert_eq!(loaded.to_values(), with_url);
    }

    #[test]
    fn ruv_values_malformed() {
        let cases = vec![
            "nocolon",
            "x:ldap://a:389",
            "70000:ldap://a:389",
            "{replicageneration}:",
            "{replica}:G1",
        ];
        for value in cases {
            assert_eq!(
                Ruv::from_values(vec![value]),
                Err(RuvError::BadFormat(value.to_string())),
                "value: {}",
                value
            );
        }
    }

    #[test]
    fn ruv_values_inconsistent() {
        let reversed = "1:ldap://a:389:000000c8000000010000:00000064000000010000";
        assert!(matches!(Ruv::from_values(vec![reversed]), Err(RuvError::BadData(_))));

        let foreign = "1:ldap://a:389:00000064000000020000";
        assert!(matches!(Ruv::from_values(vec![foreign]), Err(RuvError::BadData(_))));

        let twice = vec!["1:ldap://a:389", "1:ldap://b:389"];
        assert!(matches!(Ruv::from_values(twice), Err(RuvError::BadData(_))));

        let generations = vec!["{replicageneration}:G1", "{replicageneration}:G2"];
        assert!(matches!(Ruv::from_values(generations), Err(RuvError::BadData(_))));
    }

    #[test]
    fn ruv_values_lenient() {
        let values = vec![
            "{replicageneration}:G1",
            "1:ldap://a:389:00000064000000010000",
            "garbage",
            "2:ldap://b:389:000000c8000000020000:00000064000000020000",
            "1:ldap://dup:389",
            "3:ldap://c:389",
        ];
        let parsed = Ruv::from_values_lenient(&values);
        assert_eq!(parsed.skipped, 3);
        assert_eq!(parsed.ruv.replica_generation(), Some("G1"));
        assert_eq!(parsed.ruv.replica_count(), 2);
        assert_eq!(parsed.ruv.get_purl_for_replica(1), Some("ldap://a:389"));
        assert!(parsed.ruv.contains_replica(3));
    }

    #[test]
    fn ruv_values_check_url() {
        let values = vec!["{replicageneration}:G1", "1:ldap://a:389"];
        let (_, matches) = Ruv::init_from_values_and_check_url(&values, 1, "ldap://a:389").unwrap();
        assert!(matches);
        let (_, matches) = Ruv::init_from_values_and_check_url(&values, 1, "ldap://z:389").unwrap();
        assert!(!matches);
    }

    #[test]
    fn ruv_last_modified_values() {
        let mut ruv = Ruv::init_new("G1", 1, "ldap://a:389");
        ruv.add_replica(2, "ldap://b:389").unwrap();
        let values = vec!["1:ldap://a:389:0000abcd", "2:ldap://b:389:00000010", "9:ldap://x:389:00000001", "bad"];

        assert_eq!(ruv.apply_last_modified_values(&values), 2);
        assert_eq!(ruv.element(1).unwrap().last_modified(), 0xabcd);
        assert_eq!(ruv.last_modified_values(), vec!["1:ldap://a:389:0000abcd", "2:ldap://b:389:00000010"]);
    }
}
