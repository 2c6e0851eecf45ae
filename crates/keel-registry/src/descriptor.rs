use sha2::{Digest, Sha256};

use keel_property::{PropertyKey, PropertyMap, PropertyValue};
use keel_resource::{PackageDescriptor, Parameterization};

const VERSION: &str = "version";
const DOWNLOAD_URL: &str = "pluginDownloadURL";
const CHECKSUMS: &str = "pluginChecksums";
const PARAMETERIZATION: &str = "parameterization";

/// The deterministic resource name of the default provider for a package
/// pin: `default`, suffixed per pinned version, download URL, and
/// parameterization so that distinct pins yield distinct provider
/// resources.
pub fn default_provider_name(descriptor: &PackageDescriptor) -> String {
    let mut name = "default".to_string();
    if let Some(version) = &descriptor.version {
        name.push('_');
        name.push_str(&version.replace(['.', '+', '-'], "_"));
    }
    if let Some(url) = &descriptor.download_url {
        name.push('_');
        name.push_str(&fingerprint(url.as_str().as_bytes()));
    }
    if let Some(parameterization) = &descriptor.parameterization {
        let mut digest = Sha256::new();
        digest.update(parameterization.name.as_bytes());
        digest.update([0]);
        digest.update(parameterization.version.as_bytes());
        digest.update([0]);
        digest.update(&parameterization.value);
        name.push('_');
        name.push_str(&hex::encode(&digest.finalize()[..4]));
    }
    name
}

fn fingerprint(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    hex::encode(&digest[..4])
}

/// The inputs of a provider resource carrying this pin.
pub fn inputs_from_descriptor(descriptor: &PackageDescriptor) -> PropertyMap {
    let mut inputs = PropertyMap::new();
    if let Some(version) = &descriptor.version {
        inputs.insert(VERSION.into(), PropertyValue::string(version));
    }
    if let Some(url) = &descriptor.download_url {
        inputs.insert(DOWNLOAD_URL.into(), PropertyValue::string(url.as_str()));
    }
    if !descriptor.checksums.is_empty() {
        let checksums = descriptor
            .checksums
            .iter()
            .map(|(platform, digest)| (PropertyKey::new(platform), PropertyValue::string(digest)))
            .collect();
        inputs.insert(CHECKSUMS.into(), PropertyValue::Object(checksums));
    }
    if let Some(parameterization) = &descriptor.parameterization {
        let mut value = PropertyMap::new();
        value.insert("name".into(), PropertyValue::string(&parameterization.name));
        value.insert(
            "version".into(),
            PropertyValue::string(&parameterization.version),
        );
        value.insert(
            "value".into(),
            PropertyValue::string(hex::encode(&parameterization.value)),
        );
        inputs.insert(PARAMETERIZATION.into(), PropertyValue::Object(value));
    }
    inputs
}

/// Recover the pin from a provider resource's persisted inputs. Unknown or
/// ill-typed entries are ignored; they belong to the provider's own
/// configuration.
pub fn descriptor_from_inputs(package: &str, inputs: &PropertyMap) -> PackageDescriptor {
    let mut descriptor = PackageDescriptor::package(package);
    if let Some(PropertyValue::String(version)) = inputs.get(&PropertyKey::new(VERSION)) {
        descriptor.version = Some(version.clone());
    }
    if let Some(PropertyValue::String(url)) = inputs.get(&PropertyKey::new(DOWNLOAD_URL)) {
        descriptor.download_url = url.parse().ok();
    }
    if let Some(PropertyValue::Object(checksums)) = inputs.get(&PropertyKey::new(CHECKSUMS)) {
        for (platform, digest) in checksums {
            if let PropertyValue::String(digest) = digest {
                descriptor
                    .checksums
                    .insert(platform.to_string(), digest.clone());
            }
        }
    }
    if let Some(PropertyValue::Object(value)) = inputs.get(&PropertyKey::new(PARAMETERIZATION)) {
        let name = value.get(&PropertyKey::new("name"));
        let version = value.get(&PropertyKey::new("version"));
        let payload = value.get(&PropertyKey::new("value"));
        if let (
            Some(PropertyValue::String(name)),
            Some(PropertyValue::String(version)),
            Some(PropertyValue::String(payload)),
        ) = (name, version, payload)
        {
            descriptor.parameterization = Some(Parameterization {
                name: name.clone(),
                version: version.clone(),
                value: hex::decode(payload).unwrap_or_default(),
            });
        }
    }
    descriptor
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unpinned_default_name_is_default() {
        let descriptor = PackageDescriptor::package("aws");
        assert_eq!(default_provider_name(&descriptor), "default");
    }

    #[test]
    fn versions_produce_distinct_names() {
        let mut a = PackageDescriptor::package("aws");
        a.version = Some("0.17.10".to_string());
        let mut b = a.clone();
        b.version = Some("0.17.11".to_string());
        assert_eq!(default_provider_name(&a), "default_0_17_10");
        assert_eq!(default_provider_name(&b), "default_0_17_11");
    }

    #[test]
    fn download_url_participates_in_identity() {
        let mut a = PackageDescriptor::package("aws");
        a.version = Some("1.0.0".to_string());
        let mut b = a.clone();
        b.download_url = Some("https://plugins.example.com/aws".parse().unwrap());
        let (name_a, name_b) = (default_provider_name(&a), default_provider_name(&b));
        assert_ne!(name_a, name_b);
        assert!(name_b.starts_with("default_1_0_0_"));
    }

    #[test]
    fn descriptor_round_trips_through_inputs() {
        let mut descriptor = PackageDescriptor::package("aws");
        descriptor.version = Some("2.3.4".to_string());
        descriptor.download_url = Some("https://plugins.example.com/aws".parse().unwrap());
        descriptor
            .checksums
            .insert("linux-amd64".to_string(), "deadbeef".to_string());
        descriptor.parameterization = Some(Parameterization {
            name: "sub".to_string(),
            version: "0.1.0".to_string(),
            value: vec![1, 2, 3],
        });
        let inputs = inputs_from_descriptor(&descriptor);
        assert_eq!(descriptor_from_inputs("aws", &inputs), descriptor);
    }
}
