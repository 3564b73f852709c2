//! Outbound C-STORE and C-ECHO to configured destination devices.
//!
//! Blocking association handling, mirroring the inbound side; callers run
//! this under `spawn_blocking`.
use crate::models::Device;
use camino::Utf8PathBuf;
use dicom::core::{DataElement, VR};
use dicom::dicom_value;
use dicom::dictionary_std::{tags, uids};
use dicom::encoding::TransferSyntaxIndex;
use dicom::object::{open_file, InMemDicomObject, StandardDataDictionary};
use dicom::transfer_syntax::TransferSyntaxRegistry;
use dicom::ul::pdu::{PDataValue, PDataValueType, PresentationContextResultReason};
use dicom::ul::{ClientAssociationOptions, Pdu};
use std::io::Write;

#[derive(thiserror::Error, Debug)]
pub enum ScuError {
    #[error("could not establish an association with {0}")]
    Establish(String, #[source] Box<dicom::ul::association::client::Error>),

    #[error("the peer accepted no usable presentation context")]
    NoPresentationContext,

    #[error(transparent)]
    Exchange(#[from] Box<dicom::ul::association::client::Error>),

    #[error("unreadable response from the peer")]
    BadResponse,
}

/// C-STORE every file to `device` over one association. Returns one success
/// flag per file, in order; a file that cannot be read or is refused by the
/// peer yields `false` without aborting the rest.
pub(crate) fn send_files(
    calling_aet: &str,
    device: &Device,
    paths: &[Utf8PathBuf],
) -> Result<Vec<bool>, ScuError> {
    let peer = format!("{}:{}", device.address, device.port);
    let mut association = ClientAssociationOptions::new()
        .calling_ae_title(calling_aet)
        .called_ae_title(&device.ae_title)
        .with_abstract_syntax(uids::POSITRON_EMISSION_TOMOGRAPHY_IMAGE_STORAGE)
        .establish_with(&peer)
        .map_err(|e| ScuError::Establish(peer.clone(), Box::new(e)))?;

    let accepted: Vec<_> = association
        .presentation_contexts()
        .iter()
        .filter(|pc| pc.reason == PresentationContextResultReason::Acceptance)
        .cloned()
        .collect();

    let mut results = Vec::with_capacity(paths.len());
    for (index, path) in paths.iter().enumerate() {
        let message_id = index as u16 + 1;
        let mut send_one = || -> anyhow::Result<bool> {
            let obj = open_file(path.as_std_path())?;
            let sop_class_uid = trim_uid(&obj.meta().media_storage_sop_class_uid);
            let sop_instance_uid = trim_uid(&obj.meta().media_storage_sop_instance_uid);
            let file_ts = trim_uid(&obj.meta().transfer_syntax);

            let pc = accepted
                .iter()
                .find(|pc| pc.transfer_syntax == file_ts)
                .or_else(|| accepted.first())
                .ok_or(ScuError::NoPresentationContext)?;
            let ts_selected = TransferSyntaxRegistry
                .get(&pc.transfer_syntax)
                .ok_or(ScuError::NoPresentationContext)?;

            let command = store_req_command(&sop_class_uid, &sop_instance_uid, message_id);
            let mut command_data = Vec::with_capacity(128);
            command.write_dataset_with_ts(
                &mut command_data,
                &dicom::transfer_syntax::entries::IMPLICIT_VR_LITTLE_ENDIAN.erased(),
            )?;
            let mut object_data = Vec::with_capacity(2048);
            obj.write_dataset_with_ts(&mut object_data, ts_selected)?;

            association
                .send(&Pdu::PData {
                    data: vec![PDataValue {
                        presentation_context_id: pc.id,
                        value_type: PDataValueType::Command,
                        is_last: true,
                        data: command_data,
                    }],
                })
                .map_err(Box::new)?;
            {
                let mut pdata = association.send_pdata(pc.id);
                pdata.write_all(&object_data)?;
            }

            let response = association.receive().map_err(Box::new)?;
            let status = cstore_response_status(response)?;
            if status != 0 {
                tracing::warn!(
                    sop_instance_uid,
                    status = format!("{status:04X}H"),
                    "peer refused the instance"
                );
            }
            Ok(status == 0)
        };
        match send_one() {
            Ok(accepted) => results.push(accepted),
            Err(e) => {
                tracing::error!(path = path.as_str(), "c-store failed: {e:#}");
                results.push(false);
            }
        }
    }
    if let Err(e) = association.release() {
        tracing::warn!("association release failed: {e}");
    }
    Ok(results)
}

fn cstore_response_status(response: Pdu) -> anyhow::Result<u16> {
    let Pdu::PData { data } = response else {
        return Err(ScuError::BadResponse.into());
    };
    let first = data.first().ok_or(ScuError::BadResponse)?;
    let command = InMemDicomObject::read_dataset_with_ts(
        first.data.as_slice(),
        &dicom::transfer_syntax::entries::IMPLICIT_VR_LITTLE_ENDIAN.erased(),
    )?;
    let status = command
        .element(tags::STATUS)
        .map_err(|_| ScuError::BadResponse)?
        .to_int::<u16>()
        .map_err(|_| ScuError::BadResponse)?;
    Ok(status)
}

/// Verify connectivity to a device with a C-ECHO.
pub fn echo(calling_aet: &str, device: &Device) -> Result<bool, ScuError> {
    let peer = format!("{}:{}", device.address, device.port);
    let mut association = ClientAssociationOptions::new()
        .calling_ae_title(calling_aet)
        .called_ae_title(&device.ae_title)
        .with_abstract_syntax(uids::VERIFICATION)
        .establish_with(&peer)
        .map_err(|e| ScuError::Establish(peer.clone(), Box::new(e)))?;
    let pc = association
        .presentation_contexts()
        .iter()
        .find(|pc| pc.reason == PresentationContextResultReason::Acceptance)
        .ok_or(ScuError::NoPresentationContext)?
        .clone();

    let command = echo_req_command(1);
    let mut command_data = Vec::with_capacity(128);
    command
        .write_dataset_with_ts(
            &mut command_data,
            &dicom::transfer_syntax::entries::IMPLICIT_VR_LITTLE_ENDIAN.erased(),
        )
        .map_err(|_| ScuError::BadResponse)?;
    association
        .send(&Pdu::PData {
            data: vec![PDataValue {
                presentation_context_id: pc.id,
                value_type: PDataValueType::Command,
                is_last: true,
                data: command_data,
            }],
        })
        .map_err(Box::new)?;

    let response = association.receive().map_err(Box::new)?;
    if let Err(e) = association.release() {
        tracing::warn!("association release failed: {e}");
    }
    let status = cstore_response_status(response).map_err(|_| ScuError::BadResponse)?;
    Ok(status == 0)
}

fn store_req_command(
    sop_class_uid: &str,
    sop_instance_uid: &str,
    message_id: u16,
) -> InMemDicomObject<StandardDataDictionary> {
    InMemDicomObject::command_from_element_iter([
        DataElement::new(
            tags::AFFECTED_SOP_CLASS_UID,
            VR::UI,
            dicom_value!(Str, sop_class_uid),
        ),
        DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [0x0001])),
        DataElement::new(tags::MESSAGE_ID, VR::US, dicom_value!(U16, [message_id])),
        DataElement::new(tags::PRIORITY, VR::US, dicom_value!(U16, [0x0000])),
        DataElement::new(
            tags::COMMAND_DATA_SET_TYPE,
            VR::US,
            dicom_value!(U16, [0x0000]),
        ),
        DataElement::new(
            tags::AFFECTED_SOP_INSTANCE_UID,
            VR::UI,
            dicom_value!(Str, sop_instance_uid),
        ),
    ])
}

fn echo_req_command(message_id: u16) -> InMemDicomObject<StandardDataDictionary> {
    InMemDicomObject::command_from_element_iter([
        DataElement::new(
            tags::AFFECTED_SOP_CLASS_UID,
            VR::UI,
            dicom_value!(Str, uids::VERIFICATION),
        ),
        DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [0x0030])),
        DataElement::new(tags::MESSAGE_ID, VR::US, dicom_value!(U16, [message_id])),
        DataElement::new(
            tags::COMMAND_DATA_SET_TYPE,
            VR::US,
            dicom_value!(U16, [0x0101]),
        ),
    ])
}

fn trim_uid(uid: &str) -> String {
    uid.trim_end_matches(['\0', ' ']).to_string()
}
